//! Listener/supervisor: two accept loops, one task per connection, and a
//! broadcast channel for cooperative shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::{console, master};
use crate::config::Config;

/// Immutable per-instance context threaded into every session at spawn.
pub struct Agent {
  pub config: Config,
  pub secret: Option<Vec<u8>>,
}

pub struct Daemon {
  agent: Arc<Agent>,
  shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
  pub fn new(config: Config, secret: Option<Vec<u8>>) -> Self {
    let (shutdown_tx, _) = broadcast::channel(1);
    Self {
      agent: Arc::new(Agent { config, secret }),
      shutdown_tx,
    }
  }

  /// Trigger cooperative shutdown of the accept loops and all sessions.
  pub fn shutdown(&self) {
    tracing::info!("initiating shutdown");
    let _ = self.shutdown_tx.send(());
  }

  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let config = &self.agent.config;
    let console_listener = TcpListener::bind(&config.listen)
      .await
      .map_err(|e| anyhow::anyhow!("cannot listen on {}: {}", config.listen, e))?;
    let master_listener = TcpListener::bind(&config.master_listen)
      .await
      .map_err(|e| anyhow::anyhow!("cannot listen on {}: {}", config.master_listen, e))?;

    tracing::info!("console CLI on {}", config.listen);
    tracing::info!("master CLI on {}", config.master_listen);
    tracing::info!("relaying to cache daemon at {}", config.varnish);

    let mut shutdown_rx = self.shutdown_tx.subscribe();
    loop {
      tokio::select! {
        result = console_listener.accept() => {
          match result {
            Ok((stream, peer)) => {
              tracing::debug!("console connection from {}", peer);
              let agent = self.agent.clone();
              let shutdown = self.shutdown_tx.subscribe();
              tokio::spawn(async move {
                if let Err(e) = console::run_session(stream, peer, agent, shutdown).await {
                  tracing::debug!("console session {} ended: {}", peer, e);
                }
              });
            }
            Err(e) => tracing::error!("console accept error: {}", e),
          }
        }
        result = master_listener.accept() => {
          match result {
            Ok((stream, peer)) => {
              let agent = self.agent.clone();
              let shutdown = self.shutdown_tx.subscribe();
              tokio::spawn(async move {
                if let Err(e) = master::run_session(stream, peer, agent, shutdown).await {
                  tracing::warn!("master session {} ended: {}", peer, e);
                }
              });
            }
            Err(e) => tracing::error!("master accept error: {}", e),
          }
        }
        _ = shutdown_rx.recv() => {
          tracing::info!("listeners shutting down");
          break;
        }
      }
    }

    // Let sessions observe the broadcast before the process unwinds.
    tokio::time::sleep(Duration::from_millis(200)).await;
    self.remove_pid_file();
    Ok(())
  }

  fn remove_pid_file(&self) {
    let path = Path::new(&self.agent.config.pid_file);
    if path.exists() {
      if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("could not remove pid file {}: {}", path.display(), e);
      }
    }
  }
}
