use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use vagent::proto::{self, Response, STATUS_AUTH, STATUS_OK};
use vagent::varnish::VarnishClient;

#[derive(Parser)]
#[command(name = "vadm", about = "Console for a cache daemon CLI port", version)]
struct Args {
  /// Gateway or daemon CLI address
  #[arg(short = 'T', long, default_value = "localhost:6083")]
  address: String,
  /// Secret file for challenge/response authentication
  #[arg(short = 'S', long)]
  secret_file: Option<String>,
  /// Seconds to wait for each response
  #[arg(short = 't', long, default_value_t = 5)]
  timeout: u64,
  /// Command and arguments; interactive when omitted
  command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  let secret = match &args.secret_file {
    Some(path) => Some(
      std::fs::read(path).map_err(|e| anyhow::anyhow!("cannot read secret {}: {}", path, e))?,
    ),
    None => None,
  };

  let (mut client, greeting) =
    VarnishClient::connect(&args.address, Duration::from_secs(args.timeout)).await?;

  let greeting_status = greeting.status;
  let (resp, _) = client.login(greeting, secret.as_deref()).await?;
  if resp.status == STATUS_AUTH {
    anyhow::bail!("{} wants authentication; pass a secret file with -S", args.address);
  }
  if resp.status != STATUS_OK {
    anyhow::bail!(
      "handshake with {} failed ({}): {}",
      args.address,
      resp.status,
      resp.first_line()
    );
  }

  if !args.command.is_empty() {
    let parts: Vec<&str> = args.command.iter().map(String::as_str).collect();
    let resp = client.ask(&proto::quote_line(&parts)).await?;
    print!("{}", resp.body_text());
    if resp.status != STATUS_OK {
      eprintln!("command failed with status {}", resp.status);
      std::process::exit(1);
    }
    return Ok(());
  }

  repl(&mut client, &args.address, greeting_status == STATUS_AUTH).await
}

async fn repl(
  client: &mut VarnishClient,
  address: &str,
  authenticated: bool,
) -> Result<(), anyhow::Error> {
  let mut editor = DefaultEditor::new()?;
  println!(
    "{} {} ({}{})",
    "vadm".green().bold(),
    env!("CARGO_PKG_VERSION"),
    address,
    if authenticated { ", authenticated" } else { "" }
  );
  println!("Type {} to leave\n", "quit".cyan());

  loop {
    match editor.readline(&format!("{} ", "vadm>".green())) {
      Ok(line) => {
        let line = line.trim();
        if line.is_empty() {
          continue;
        }
        let _ = editor.add_history_entry(line);
        if line == "quit" || line == "exit" {
          break;
        }
        match client.ask(line).await {
          Ok(resp) => print_response(&resp),
          Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            break;
          }
        }
      }
      Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
      Err(e) => {
        eprintln!("Error: {:?}", e);
        break;
      }
    }
  }
  Ok(())
}

fn print_response(resp: &Response) {
  let status = resp.status.to_string();
  if resp.status == STATUS_OK {
    println!("{}", status.green());
  } else {
    println!("{}", status.red());
  }
  let body = resp.body_text();
  if !body.is_empty() {
    println!("{}", body.trim_end());
  }
}
