//! Interception of console commands on their way to the cache daemon.
//!
//! Unlisted commands take the default path: relay the raw request, read one
//! response, hand it back for the console. The handlers here observe or
//! replace that flow to keep the persisted state in step with the daemon.

use crate::proto::{self, ProtoError, Response};
use crate::state::StateStore;
use crate::varnish::VarnishClient;

/// A command parsed off the console socket.
///
/// `raw` is the original text, here-document included, so the default relay
/// path is byte-exact. A captured here-document body is the final element of
/// `args`.
#[derive(Debug, Clone)]
pub struct Request {
  pub raw: String,
  pub name: String,
  pub args: Vec<String>,
  pub has_body: bool,
}

/// Everything a handler may touch.
pub struct InterceptContext<'a> {
  pub varnish: &'a mut VarnishClient,
  pub state: &'a StateStore,
  pub stats_command: &'a str,
  pub has_secret: bool,
  pub authenticated: &'a mut bool,
}

/// Dispatch one console command by exact match on its name.
pub async fn dispatch(
  ctx: &mut InterceptContext<'_>,
  req: &Request,
) -> Result<Response, ProtoError> {
  match req.name.as_str() {
    "auth" => cmd_auth(ctx, req).await,
    "vcl.use" => cmd_vcl_use(ctx, req).await,
    "param.set" => cmd_param_set(ctx, req).await,
    "agent.stat" => Ok(cmd_agent_stat(ctx).await),
    _ => relay(ctx, req).await,
  }
}

/// Default path: forward the raw request, read one response.
async fn relay(ctx: &mut InterceptContext<'_>, req: &Request) -> Result<Response, ProtoError> {
  ctx.varnish.send_raw(req.raw.as_bytes()).await?;
  ctx.varnish.read_response().await
}

/// `auth` passes through untouched, but an accepting daemon flips the
/// session's authentication gate before the console sees the response.
async fn cmd_auth(ctx: &mut InterceptContext<'_>, req: &Request) -> Result<Response, ProtoError> {
  let resp = relay(ctx, req).await?;
  if resp.is_ok() {
    *ctx.authenticated = true;
    tracing::debug!("console session authenticated");
  }
  Ok(resp)
}

/// `vcl.use <name>` first fetches the configuration body with `vcl.show`;
/// when both steps succeed the body becomes the persisted VCL. The console
/// only ever sees the `vcl.use` response.
async fn cmd_vcl_use(
  ctx: &mut InterceptContext<'_>,
  req: &Request,
) -> Result<Response, ProtoError> {
  let Some(name) = req.args.first() else {
    // Missing argument: let the daemon phrase the complaint.
    return relay(ctx, req).await;
  };

  let show = ctx
    .varnish
    .ask(&proto::quote_line(&["vcl.show", name]))
    .await?;
  let resp = relay(ctx, req).await?;

  if show.is_ok() && resp.is_ok() {
    match ctx.state.save_vcl(&show.body).await {
      Ok(()) => tracing::info!("persisted vcl {} ({} bytes)", name, show.body.len()),
      Err(e) => tracing::warn!("could not persist vcl {}: {}", name, e),
    }
  }
  Ok(resp)
}

/// `param.set <name> <value>` persists the pair, but only once the daemon
/// has acknowledged it.
async fn cmd_param_set(
  ctx: &mut InterceptContext<'_>,
  req: &Request,
) -> Result<Response, ProtoError> {
  let resp = relay(ctx, req).await?;
  if resp.is_ok() && req.args.len() >= 2 {
    let name = &req.args[0];
    let value = req.args[1..].join(" ");
    match ctx.state.set_param(name, &value).await {
      Ok(()) => tracing::debug!("persisted param {}={}", name, value),
      Err(e) => tracing::warn!("could not persist param {}: {}", name, e),
    }
  }
  Ok(resp)
}

/// `agent.stat` never reaches the daemon: it runs the configured statistics
/// command locally. With a secret configured it requires an authenticated
/// session.
async fn cmd_agent_stat(ctx: &mut InterceptContext<'_>) -> Response {
  if ctx.has_secret && !*ctx.authenticated {
    return Response::cant("Not an authenticated connection");
  }
  match run_stats(ctx.stats_command).await {
    Ok(stdout) => Response::ok(stdout),
    Err(e) => Response::cant(&e.to_string()),
  }
}

/// Run the statistics command through the shell and capture its stdout.
pub async fn run_stats(command: &str) -> Result<Vec<u8>, anyhow::Error> {
  let output = tokio::process::Command::new("sh")
    .arg("-c")
    .arg(command)
    .output()
    .await
    .map_err(|e| anyhow::anyhow!("cannot run {:?}: {}", command, e))?;

  if !output.status.success() {
    anyhow::bail!(
      "{:?} failed ({}): {}",
      command,
      output.status,
      String::from_utf8_lossy(&output.stderr).trim()
    );
  }
  Ok(output.stdout)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_run_stats_captures_stdout() {
    let out = run_stats("printf 'a b c'").await.unwrap();
    assert_eq!(out, b"a b c");
  }

  #[tokio::test]
  async fn test_run_stats_failure_reports_stderr() {
    let err = run_stats("echo boom >&2; exit 3").await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("boom"), "got: {}", msg);
  }
}
