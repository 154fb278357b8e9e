use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vagent::announce;
use vagent::config::Config;
use vagent::server::Daemon;

#[derive(Parser)]
#[command(name = "vagentd", about = "Administrative CLI gateway for a cache daemon", version)]
struct Args {
  /// Configuration file ("Key Value" lines)
  #[arg(short = 'c', long, env = "VAGENT_CONFIG")]
  config: Option<String>,
  /// Stay attached to the terminal
  #[arg(short = 'F', long)]
  foreground: bool,
  #[arg(short = 'd', long)]
  debug: bool,
  #[arg(short = 'P', long)]
  pid_file: Option<String>,
  /// Console listen address
  #[arg(short = 'T', long)]
  listen: Option<String>,
  /// Address of the cache daemon's administrative port
  #[arg(short = 'b', long)]
  varnish: Option<String>,
  /// Listen address for daemon-initiated master connections
  #[arg(short = 'M', long)]
  master_listen: Option<String>,
  #[arg(short = 'f', long)]
  vcl_file: Option<String>,
  #[arg(short = 'p', long)]
  params_file: Option<String>,
  #[arg(short = 'S', long)]
  secret_file: Option<String>,
  /// Instance identifier used by the announcement
  #[arg(short = 'n', long)]
  name: Option<String>,
  #[arg(short = 'z', long)]
  announce_url: Option<String>,
  /// Extra PEM root certificate for the announcement endpoint
  #[arg(short = 'C', long)]
  ca_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  let mut config = match &args.config {
    Some(path) => Config::from_file(path)?,
    None => Config::default(),
  };

  // CLI args override config file
  if args.foreground {
    config.foreground = true;
  }
  if args.debug {
    config.debug = true;
  }
  if let Some(pid_file) = args.pid_file {
    config.pid_file = pid_file;
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(varnish) = args.varnish {
    config.varnish = varnish;
  }
  if let Some(master_listen) = args.master_listen {
    config.master_listen = master_listen;
  }
  if let Some(vcl_file) = args.vcl_file {
    config.vcl_file = vcl_file;
  }
  if let Some(params_file) = args.params_file {
    config.params_file = params_file;
  }
  if let Some(secret_file) = args.secret_file {
    config.secret_file = Some(secret_file);
  }
  if let Some(name) = args.name {
    config.agent_id = name;
  }
  if let Some(announce_url) = args.announce_url {
    config.announce_url = Some(announce_url);
  }
  if let Some(ca_file) = args.ca_file {
    config.ca_file = Some(ca_file);
  }

  let level = if config.debug { "debug" } else { "info" };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
    )
    .with(tracing_subscriber::fmt::layer().with_ansi(config.foreground))
    .init();

  let secret = config.read_secret()?;
  if secret.is_some() {
    tracing::info!("shared secret loaded from {}", config.secret_file.as_deref().unwrap_or(""));
  }

  claim_pid_file(&config.pid_file)?;
  ensure_writable_parents(&config)?;

  let daemon = Arc::new(Daemon::new(config.clone(), secret.clone()));

  // SIGINT/SIGTERM arm the shutdown broadcast; a delayed exit backstops
  // sessions that never reach a suspension point.
  let signal_daemon = daemon.clone();
  tokio::spawn(async move {
    shutdown_signal().await;
    signal_daemon.shutdown();
    tokio::time::sleep(Duration::from_secs(2)).await;
    std::process::exit(0);
  });

  // Fire-and-forget call home.
  let announce_config = config.clone();
  let announce_secret = secret.clone();
  tokio::spawn(async move {
    announce::announce(&announce_config, announce_secret.as_deref()).await;
  });

  let result = daemon.run().await;
  if result.is_err() {
    // A failed startup must not gate the next one.
    let _ = std::fs::remove_file(&config.pid_file);
  }
  result
}

/// A present PID file gates a second startup; otherwise claim it.
fn claim_pid_file(path: &str) -> Result<(), anyhow::Error> {
  let pid_path = Path::new(path);
  if pid_path.exists() {
    let pid = std::fs::read_to_string(pid_path)
      .ok()
      .and_then(|s| s.trim().parse::<u32>().ok());
    match pid {
      Some(pid) => anyhow::bail!(
        "already running with pid {} per {}; remove the file if stale",
        pid,
        path
      ),
      None => anyhow::bail!("pid file {} exists; remove it if stale", path),
    }
  }
  if let Some(parent) = pid_path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)?;
    }
  }
  std::fs::write(pid_path, std::process::id().to_string())
    .map_err(|e| anyhow::anyhow!("cannot write pid file {}: {}", path, e))
}

/// Unwritable state paths are a startup error, not a mid-session surprise.
fn ensure_writable_parents(config: &Config) -> Result<(), anyhow::Error> {
  for path in [&config.vcl_file, &config.params_file] {
    if let Some(parent) = Path::new(path).parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| anyhow::anyhow!("cannot create {}: {}", parent.display(), e))?;
      }
    }
  }
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
