//! Gateway configuration: defaults, the `Key Value` config file, and the
//! startup secret.

use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
  /// Console-side listen address
  pub listen: String,
  /// Listen address for daemon-initiated master connections
  pub master_listen: String,
  /// Address of the cache daemon's administrative port
  pub varnish: String,
  pub vcl_file: String,
  pub params_file: String,
  pub secret_file: Option<String>,
  pub pid_file: String,
  /// Instance identifier reported by the announcement
  pub agent_id: String,
  pub announce_url: Option<String>,
  /// Extra PEM root certificate for the announcement endpoint
  pub ca_file: Option<String>,
  /// Command whose stdout backs `agent.stat`
  pub stats_command: String,
  /// Daemon-side response read timeout
  pub timeout: Duration,
  pub debug: bool,
  pub foreground: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen: "0.0.0.0:6083".into(),
      master_listen: "localhost:6084".into(),
      varnish: "localhost:6082".into(),
      vcl_file: "./data/agent.vcl".into(),
      params_file: "./data/agent.params".into(),
      secret_file: None,
      pid_file: "./data/vagent.pid".into(),
      agent_id: "vagent".into(),
      announce_url: None,
      ca_file: None,
      stats_command: "varnishstat -1 -x".into(),
      timeout: Duration::from_secs(1),
      debug: false,
      foreground: false,
    }
  }
}

impl Config {
  /// Load a `Key Value` configuration file. Blank lines and `#` comments
  /// are skipped; unknown keys are reported and rejected.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
      .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;

    let mut config = Self::default();
    for (lineno, line) in content.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let (key, value) = line
        .split_once(char::is_whitespace)
        .map(|(k, v)| (k, v.trim()))
        .ok_or_else(|| {
          anyhow::anyhow!("{}:{}: expected `Key Value`", path.display(), lineno + 1)
        })?;
      config
        .apply(key, value)
        .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), lineno + 1, e))?;
    }
    Ok(config)
  }

  fn apply(&mut self, key: &str, value: &str) -> Result<(), anyhow::Error> {
    match key {
      "ListenAddress" => self.listen = value.into(),
      "MasterListenAddress" => self.master_listen = value.into(),
      "VarnishAddress" => self.varnish = value.into(),
      "VclFile" => self.vcl_file = value.into(),
      "ParamsFile" => self.params_file = value.into(),
      "SecretFile" => self.secret_file = Some(value.into()),
      "PidFile" => self.pid_file = value.into(),
      "AgentId" => self.agent_id = value.into(),
      "AnnounceUrl" => self.announce_url = Some(value.into()),
      "CaFile" => self.ca_file = Some(value.into()),
      "StatsCommand" => self.stats_command = value.into(),
      "Timeout" => {
        let secs: u64 = value
          .parse()
          .map_err(|_| anyhow::anyhow!("Timeout wants a number of seconds, got {:?}", value))?;
        self.timeout = Duration::from_secs(secs);
      }
      "Debug" => self.debug = parse_bool(value)?,
      "Foreground" => self.foreground = parse_bool(value)?,
      _ => anyhow::bail!("unknown key {:?}", key),
    }
    Ok(())
  }

  /// Load the shared secret, when one is configured. An unreadable secret
  /// file aborts startup.
  pub fn read_secret(&self) -> Result<Option<Vec<u8>>, anyhow::Error> {
    match &self.secret_file {
      None => Ok(None),
      Some(path) => std::fs::read(path)
        .map(Some)
        .map_err(|e| anyhow::anyhow!("cannot read secret file {}: {}", path, e)),
    }
  }

  /// Port half of the console listen address, for the announcement.
  pub fn listen_port(&self) -> &str {
    self.listen.rsplit(':').next().unwrap_or("")
  }

  /// Port half of the cache daemon address, for the announcement.
  pub fn varnish_port(&self) -> &str {
    self.varnish.rsplit(':').next().unwrap_or("")
  }
}

fn parse_bool(value: &str) -> Result<bool, anyhow::Error> {
  match value {
    "on" | "yes" | "true" | "1" => Ok(true),
    "off" | "no" | "false" | "0" => Ok(false),
    _ => anyhow::bail!("expected a boolean, got {:?}", value),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.listen, "0.0.0.0:6083");
    assert_eq!(config.varnish, "localhost:6082");
    assert_eq!(config.master_listen, "localhost:6084");
    assert_eq!(config.timeout, Duration::from_secs(1));
    assert!(config.secret_file.is_none());
  }

  #[test]
  fn test_from_file() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "# gateway config").unwrap();
    writeln!(f, "ListenAddress 127.0.0.1:7083").unwrap();
    writeln!(f, "VarnishAddress 127.0.0.1:7082").unwrap();
    writeln!(f).unwrap();
    writeln!(f, "SecretFile /etc/varnish/secret").unwrap();
    writeln!(f, "StatsCommand varnishstat -1 -x").unwrap();
    writeln!(f, "Timeout 5").unwrap();
    writeln!(f, "Debug on").unwrap();

    let config = Config::from_file(f.path()).unwrap();
    assert_eq!(config.listen, "127.0.0.1:7083");
    assert_eq!(config.varnish, "127.0.0.1:7082");
    assert_eq!(config.secret_file.as_deref(), Some("/etc/varnish/secret"));
    assert_eq!(config.stats_command, "varnishstat -1 -x");
    assert_eq!(config.timeout, Duration::from_secs(5));
    assert!(config.debug);
    // untouched keys keep their defaults
    assert_eq!(config.master_listen, "localhost:6084");
  }

  #[test]
  fn test_from_file_rejects_unknown_key() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "Bogus value").unwrap();
    let err = Config::from_file(f.path()).unwrap_err().to_string();
    assert!(err.contains("Bogus"), "got: {}", err);
  }

  #[test]
  fn test_port_helpers() {
    let config = Config::default();
    assert_eq!(config.listen_port(), "6083");
    assert_eq!(config.varnish_port(), "6082");
  }
}
