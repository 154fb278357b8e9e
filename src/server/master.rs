//! Master sessions: the cache daemon calls in at its own startup to have
//! parameters and the active VCL restored, then the line is kept open.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::daemon::Agent;
use crate::proto::{self, STATUS_AUTH};
use crate::state::{self, StateStore};
use crate::varnish::VarnishClient;

pub async fn run_session(
  stream: TcpStream,
  peer: SocketAddr,
  agent: Arc<Agent>,
  mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), anyhow::Error> {
  tracing::info!("master connection from {}", peer);
  let (mut varnish, greeting) = VarnishClient::adopt(stream, agent.config.timeout).await?;

  let (resp, authenticated) = varnish.login(greeting, agent.secret.as_deref()).await?;
  if resp.status == STATUS_AUTH {
    anyhow::bail!("daemon demands authentication but no secret is configured");
  }
  if !resp.is_ok() {
    anyhow::bail!(
      "daemon handshake ended with status {}: {}",
      resp.status,
      resp.first_line()
    );
  }

  let state = StateStore::new(&agent.config.params_file, &agent.config.vcl_file);
  replay_params(&mut varnish, &state).await?;
  replay_vcl(&mut varnish, &state, authenticated).await?;

  // Stay on the line so the daemon does not exit; whatever it prints is
  // logged and otherwise ignored.
  loop {
    tokio::select! {
      line = varnish.read_line() => {
        match line? {
          None => {
            tracing::info!("master connection {} closed by daemon", peer);
            break;
          }
          Some(line) => tracing::info!("daemon: {}", line.trim_end()),
        }
      }
      _ = shutdown_rx.recv() => {
        tracing::debug!("master session {} shutting down", peer);
        break;
      }
    }
  }
  Ok(())
}

/// Re-issue every persisted parameter in list order. Individual rejections
/// are logged, not fatal.
async fn replay_params(
  varnish: &mut VarnishClient,
  state: &StateStore,
) -> Result<(), anyhow::Error> {
  for (name, value) in state.load_params().await {
    let line = proto::quote_line(&["param.set", &name, &value]);
    let resp = varnish.ask(&line).await?;
    if resp.is_ok() {
      tracing::info!("restored param {}={}", name, value);
    } else {
      tracing::warn!(
        "param.set {} rejected ({}): {}",
        name,
        resp.status,
        resp.first_line()
      );
    }
  }
  Ok(())
}

/// Load the persisted VCL under its content fingerprint, activate it, and
/// start the daemon. Each step only runs when the previous one succeeded;
/// failures are logged and the session continues.
async fn replay_vcl(
  varnish: &mut VarnishClient,
  state: &StateStore,
  authenticated: bool,
) -> Result<(), anyhow::Error> {
  let Some(body) = state.load_vcl().await else {
    return Ok(());
  };
  let name = state::vcl_name(&body);
  if !authenticated {
    tracing::warn!("replaying vcl without authentication; the daemon will likely reject the here-document");
  }

  let text = String::from_utf8_lossy(&body);
  let command = proto::format_heredoc(&["vcl.inline", &name], &text);
  varnish.send_raw(command.as_bytes()).await?;
  let resp = varnish.read_response().await?;
  if !resp.is_ok() {
    tracing::warn!(
      "vcl.inline {} rejected ({}): {}",
      name,
      resp.status,
      resp.first_line()
    );
    return Ok(());
  }

  let resp = varnish.ask(&proto::quote_line(&["vcl.use", &name])).await?;
  if !resp.is_ok() {
    tracing::warn!(
      "vcl.use {} rejected ({}): {}",
      name,
      resp.status,
      resp.first_line()
    );
    return Ok(());
  }

  let resp = varnish.ask("start").await?;
  if resp.is_ok() {
    tracing::info!("daemon restored and started with vcl {}", name);
  } else {
    tracing::warn!("start rejected ({}): {}", resp.status, resp.first_line());
  }
  Ok(())
}
