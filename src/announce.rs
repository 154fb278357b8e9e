//! One-shot startup announcement to a configured HTTP endpoint.
//!
//! Fire and forget: every failure here is logged and swallowed, the gateway
//! runs the same either way.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::Config;

pub async fn announce(config: &Config, secret: Option<&[u8]>) {
  let Some(url) = config.announce_url.as_deref() else {
    return;
  };
  if let Err(e) = send(config, url, secret).await {
    tracing::warn!("announcement to {} failed: {}", url, e);
  }
}

async fn send(config: &Config, url: &str, secret: Option<&[u8]>) -> Result<(), anyhow::Error> {
  let parsed = reqwest::Url::parse(url)?;
  let host = parsed
    .host_str()
    .ok_or_else(|| anyhow::anyhow!("announcement URL has no host"))?;
  let port = parsed
    .port_or_known_default()
    .ok_or_else(|| anyhow::anyhow!("announcement URL has no usable port"))?;

  // The reported ip is the source address this machine uses to reach the
  // announcement host, which a NATed gateway cannot learn any other way.
  let probe = TcpStream::connect((host, port)).await?;
  let local_ip = probe.local_addr()?.ip().to_string();
  drop(probe);

  let mut query: Vec<(&str, String)> = vec![
    ("ip", local_ip),
    ("port", config.varnish_port().to_string()),
    ("cliPort", config.listen_port().to_string()),
    ("agentId", config.agent_id.clone()),
  ];
  if let Some(secret) = secret {
    query.push(("secret", String::from_utf8_lossy(secret).into_owned()));
  }

  let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
  if let Some(ca_file) = &config.ca_file {
    let pem = std::fs::read(ca_file)
      .map_err(|e| anyhow::anyhow!("cannot read CA file {}: {}", ca_file, e))?;
    builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
  }
  let client = builder.build()?;

  let resp = client.get(parsed).query(&query).send().await?;
  tracing::info!("announced to {} ({})", url, resp.status());
  Ok(())
}
