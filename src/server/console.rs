//! Console sessions: relay between an administrative console and the cache
//! daemon, with interception on the console-to-daemon direction.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::daemon::Agent;
use crate::intercept::{self, InterceptContext, Request};
use crate::proto::{self, write_response};
use crate::state::StateStore;
use crate::varnish::VarnishClient;

pub async fn run_session(
  stream: TcpStream,
  peer: SocketAddr,
  agent: Arc<Agent>,
  mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), anyhow::Error> {
  let (mut varnish, greeting) =
    VarnishClient::connect(&agent.config.varnish, agent.config.timeout).await?;

  let (console_read, mut console_write) = stream.into_split();
  let mut console = BufReader::new(console_read);

  // The greeting (OK or AUTH) goes to the console unchanged; when it is a
  // challenge, the console answers it itself and `auth` passes through the
  // interceptor below.
  write_response(&mut console_write, &greeting).await?;

  let state = StateStore::new(&agent.config.params_file, &agent.config.vcl_file);
  let mut authenticated = false;

  loop {
    tokio::select! {
      ready = proto::readable(&mut console) => {
        if ready? == 0 {
          tracing::debug!("console {} closed the connection", peer);
          break;
        }
        let Some(req) = read_request(&mut console, authenticated).await? else {
          continue;
        };
        let mut ctx = InterceptContext {
          varnish: &mut varnish,
          state: &state,
          stats_command: &agent.config.stats_command,
          has_secret: agent.secret.is_some(),
          authenticated: &mut authenticated,
        };
        let resp = intercept::dispatch(&mut ctx, &req).await?;
        write_response(&mut console_write, &resp).await?;
      }
      ready = varnish.readable() => {
        if ready? == 0 {
          tracing::debug!("daemon closed the connection for console {}", peer);
          break;
        }
        // A frame the console did not ask for; forward in receipt order.
        let resp = varnish.read_response().await?;
        write_response(&mut console_write, &resp).await?;
      }
      _ = shutdown_rx.recv() => {
        tracing::debug!("console session {} shutting down", peer);
        break;
      }
    }
  }
  Ok(())
}

/// Read one command off the console. Here-documents are only recognized on
/// authenticated sessions; otherwise the suffix stays on the line and the
/// daemon gets to reject it. Returns `None` for blank lines.
async fn read_request(
  console: &mut BufReader<OwnedReadHalf>,
  authenticated: bool,
) -> Result<Option<Request>, anyhow::Error> {
  let mut line = String::new();
  let n = console.read_line(&mut line).await?;
  if n == 0 {
    anyhow::bail!("console closed mid-request");
  }

  let mut raw = line.clone();
  let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
  if trimmed.is_empty() {
    return Ok(None);
  }

  let mut body = None;
  let mut command_part = trimmed.as_str();
  if authenticated {
    if let Some((head, token)) = proto::heredoc_delimiter(&trimmed) {
      let mut collected = String::new();
      loop {
        let mut next = String::new();
        let n = console.read_line(&mut next).await?;
        if n == 0 {
          anyhow::bail!("console closed inside a here-document");
        }
        raw.push_str(&next);
        let next_trimmed = next.trim_end_matches(['\r', '\n']);
        if next_trimmed == token {
          break;
        }
        collected.push_str(next_trimmed);
        collected.push('\n');
      }
      body = Some(collected);
      command_part = head;
    }
  }

  let mut args = proto::split_line(command_part)?;
  if args.is_empty() {
    return Ok(None);
  }
  let name = args.remove(0);
  let has_body = body.is_some();
  if let Some(body) = body {
    args.push(body);
  }

  Ok(Some(Request {
    raw,
    name,
    args,
    has_body,
  }))
}
