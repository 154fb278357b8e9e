//! Cache-daemon CLI wire codec
//!
//! Both sides of the gateway speak the same line protocol:
//!
//! ## Requests
//! One LF-terminated command line: a command name followed by quoted
//! arguments. A trailing ` << TOKEN` announces a here-document; the body
//! runs until a line containing exactly `TOKEN`.
//!
//! ## Responses
//! A fixed 13-byte header line (`"<status> <length>"` left-justified in 12
//! columns, then LF), exactly `length` payload bytes, then one trailing LF.

use std::borrow::Cow;
use std::fmt;
use std::io;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Status codes used on response headers
pub const STATUS_SYNTAX: u32 = 100;
pub const STATUS_UNKNOWN: u32 = 101;
pub const STATUS_UNIMPL: u32 = 102;
pub const STATUS_TOOFEW: u32 = 104;
pub const STATUS_TOOMANY: u32 = 105;
pub const STATUS_PARAM: u32 = 106;
pub const STATUS_AUTH: u32 = 107;
pub const STATUS_OK: u32 = 200;
pub const STATUS_CANT: u32 = 300;
pub const STATUS_COMMS: u32 = 400;
pub const STATUS_CLOSE: u32 = 500;

/// Width of the header line excluding the terminating LF
const HEADER_WIDTH: usize = 12;

/// Codec errors
#[derive(Debug)]
pub enum ProtoError {
  /// Malformed frame or command line
  Syntax(String),
  /// Transport failure, including the peer going away mid-frame
  Io(io::Error),
  /// The daemon did not answer within the configured window
  Timeout,
}

impl fmt::Display for ProtoError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ProtoError::Syntax(msg) => write!(f, "protocol syntax error: {}", msg),
      ProtoError::Io(e) => write!(f, "IO error: {}", e),
      ProtoError::Timeout => write!(f, "read timed out"),
    }
  }
}

impl std::error::Error for ProtoError {}

impl From<io::Error> for ProtoError {
  fn from(e: io::Error) -> Self {
    ProtoError::Io(e)
  }
}

/// A response frame in either direction.
///
/// The body is kept as raw bytes so that relayed frames are byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u32,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u32, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(STATUS_OK, body)
  }

  pub fn cant(msg: &str) -> Self {
    Self::new(STATUS_CANT, msg.as_bytes().to_vec())
  }

  pub fn is_ok(&self) -> bool {
    self.status == STATUS_OK
  }

  pub fn body_text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  /// First line of the body, e.g. the challenge of an AUTH greeting.
  pub fn first_line(&self) -> String {
    let end = self
      .body
      .iter()
      .position(|&b| b == b'\n')
      .unwrap_or(self.body.len());
    String::from_utf8_lossy(&self.body[..end]).into_owned()
  }

  /// Encode as header + payload + trailing LF.
  pub fn encode(&self) -> Vec<u8> {
    let header = format!(
      "{:<width$}\n",
      format!("{} {}", self.status, self.body.len()),
      width = HEADER_WIDTH
    );
    let mut out = header.into_bytes();
    out.extend_from_slice(&self.body);
    out.push(b'\n');
    out
  }
}

/// Parse a header line of the form `^(\d+)\s+(\d+)\s*$`.
fn parse_header(line: &str) -> Result<(u32, usize), ProtoError> {
  let bad = || ProtoError::Syntax(format!("malformed response header {:?}", line));
  let rest = line.trim_end();
  let (status, len) = rest.split_once(char::is_whitespace).ok_or_else(bad)?;
  let len = len.trim_start();
  if status.is_empty() || len.is_empty() {
    return Err(bad());
  }
  if !status.bytes().all(|b| b.is_ascii_digit()) || !len.bytes().all(|b| b.is_ascii_digit()) {
    return Err(bad());
  }
  let status = status.parse().map_err(|_| bad())?;
  let len = len.parse().map_err(|_| bad())?;
  Ok((status, len))
}

/// Read one response frame, skipping blank lines before the header.
pub async fn read_response<R>(reader: &mut R) -> Result<Response, ProtoError>
where
  R: AsyncBufRead + Unpin,
{
  let mut header = String::new();
  loop {
    header.clear();
    let n = reader.read_line(&mut header).await?;
    if n == 0 {
      return Err(ProtoError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed while waiting for a response header",
      )));
    }
    if !header.trim().is_empty() {
      break;
    }
  }

  let (status, len) = parse_header(header.trim_end_matches(['\r', '\n']))?;

  let mut body = vec![0u8; len];
  reader.read_exact(&mut body).await?;

  // One trailing line follows the payload; its contents are discarded.
  let mut trailer = String::new();
  reader.read_line(&mut trailer).await?;

  Ok(Response { status, body })
}

/// Write one response frame and flush.
pub async fn write_response<W>(writer: &mut W, resp: &Response) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&resp.encode()).await?;
  writer.flush().await
}

/// Wait until the reader has buffered data; returns 0 at end of stream.
///
/// `fill_buf` is cancel safe, which makes this usable inside `select!`.
pub async fn readable<R>(reader: &mut R) -> io::Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  Ok(reader.fill_buf().await?.len())
}

/// Serialize one argument for a command line.
///
/// Backslash, double quote, LF/CR/TAB and non-printable bytes are escaped;
/// arguments containing whitespace (and empty arguments) are quoted.
pub fn quote(arg: &str) -> String {
  let needs_quotes = arg.is_empty() || arg.bytes().any(|b| b.is_ascii_whitespace());
  let mut out = String::with_capacity(arg.len() + 2);
  for b in arg.bytes() {
    match b {
      b'\\' => out.push_str("\\\\"),
      b'"' => out.push_str("\\\""),
      b'\n' => out.push_str("\\n"),
      b'\r' => out.push_str("\\r"),
      b'\t' => out.push_str("\\t"),
      0x20..=0x7e => out.push(b as char),
      _ => out.push_str(&format!("\\{:03o}", b)),
    }
  }
  if needs_quotes {
    format!("\"{}\"", out)
  } else {
    out
  }
}

/// Serialize a full command line (without the terminating LF).
pub fn quote_line(args: &[&str]) -> String {
  args.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
}

/// Resolve escapes in one token with a single left-to-right pass, so that
/// the result of `\\` is never re-interpreted by the other rules.
fn unescape(token: &str) -> String {
  let bytes = token.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] != b'\\' || i + 1 >= bytes.len() {
      out.push(bytes[i]);
      i += 1;
      continue;
    }
    match bytes[i + 1] {
      b'\\' => {
        out.push(b'\\');
        i += 2;
      }
      b'n' => {
        out.push(b'\n');
        i += 2;
      }
      b'r' => {
        out.push(b'\r');
        i += 2;
      }
      b't' => {
        out.push(b'\t');
        i += 2;
      }
      b'"' => {
        out.push(b'"');
        i += 2;
      }
      b'x' if i + 3 < bytes.len()
        && bytes[i + 2].is_ascii_hexdigit()
        && bytes[i + 3].is_ascii_hexdigit() =>
      {
        // \xHH, exactly two hex digits
        let hi = (bytes[i + 2] as char).to_digit(16).unwrap();
        let lo = (bytes[i + 3] as char).to_digit(16).unwrap();
        out.push((hi * 16 + lo) as u8);
        i += 4;
      }
      b'0'..=b'7' => {
        // \ooo, one to three octal digits
        let mut value: u32 = 0;
        let mut used = 0;
        while used < 3 && i + 1 + used < bytes.len() && (b'0'..=b'7').contains(&bytes[i + 1 + used])
        {
          value = value * 8 + (bytes[i + 1 + used] - b'0') as u32;
          used += 1;
        }
        out.push(value as u8);
        i += 1 + used;
      }
      other => {
        // Unknown escape, kept verbatim
        out.push(b'\\');
        out.push(other);
        i += 2;
      }
    }
  }
  String::from_utf8_lossy(&out).into_owned()
}

/// Tokenize a command line into unescaped arguments.
///
/// A double-quoted run consumes through the next unescaped quote; anything
/// else is a maximal run of non-whitespace characters. Unbalanced quotes are
/// a syntax error.
pub fn split_line(line: &str) -> Result<Vec<String>, ProtoError> {
  let bytes = line.as_bytes();
  let mut args = Vec::new();
  let mut i = 0;
  while i < bytes.len() {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
      i += 1;
    }
    if i >= bytes.len() {
      break;
    }
    if bytes[i] == b'"' {
      i += 1;
      let start = i;
      let mut closed = false;
      while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
          i += 2;
        } else if bytes[i] == b'"' {
          closed = true;
          break;
        } else {
          i += 1;
        }
      }
      if !closed {
        return Err(ProtoError::Syntax("unbalanced quotes".into()));
      }
      args.push(unescape(&line[start..i]));
      i += 1;
    } else {
      let start = i;
      while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
        i += 1;
      }
      args.push(unescape(&line[start..i]));
    }
  }
  Ok(args)
}

/// Detect a trailing here-document announcement on a command line.
///
/// Returns the line without the suffix and the delimiter token.
pub fn heredoc_delimiter(line: &str) -> Option<(&str, &str)> {
  let idx = line.rfind(" << ")?;
  let token = &line[idx + 4..];
  if token.is_empty() {
    return None;
  }
  if !token.chars().all(|c| c.is_alphanumeric() || c == '_') {
    return None;
  }
  Some((&line[..idx], token))
}

/// Pick a here-document delimiter that does not occur inside the body.
pub fn heredoc_token(body: &str) -> String {
  let mut rng = rand::thread_rng();
  loop {
    let token: String = (0..8).map(|_| rng.gen_range('a'..='z')).collect();
    if !body.contains(&token) {
      return token;
    }
  }
}

/// Serialize a command carrying its final argument as a here-document.
pub fn format_heredoc(args: &[&str], body: &str) -> String {
  let token = heredoc_token(body);
  let mut out = format!("{} << {}\n", quote_line(args), token);
  out.push_str(body);
  if !body.ends_with('\n') {
    out.push('\n');
  }
  out.push_str(&token);
  out.push('\n');
  out
}

/// Challenge/response digest: `SHA256(challenge LF secret challenge LF)` in
/// lowercase hex.
pub fn auth_response(challenge: &str, secret: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(challenge.as_bytes());
  hasher.update(b"\n");
  hasher.update(secret);
  hasher.update(challenge.as_bytes());
  hasher.update(b"\n");
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_is_thirteen_bytes() {
    let resp = Response::ok(b"Hello".to_vec());
    let encoded = resp.encode();
    assert_eq!(&encoded[..13], b"200 5       \n");
    assert_eq!(&encoded[13..], b"Hello\n");

    let resp = Response::new(STATUS_UNKNOWN, b"Unknown request".to_vec());
    let encoded = resp.encode();
    assert_eq!(encoded.len(), 13 + 15 + 1);
    assert_eq!(encoded[12], b'\n');
  }

  #[tokio::test]
  async fn test_decode_roundtrip() {
    let resp = Response::new(STATUS_CANT, b"no can do".to_vec());
    let mut cursor = std::io::Cursor::new(resp.encode());
    let mut reader = tokio::io::BufReader::new(&mut cursor);
    let decoded = read_response(&mut reader).await.unwrap();
    assert_eq!(decoded, resp);
  }

  #[tokio::test]
  async fn test_decode_skips_blank_lines() {
    let mut data = b"\n\n".to_vec();
    data.extend_from_slice(&Response::ok(b"x".to_vec()).encode());
    let mut cursor = std::io::Cursor::new(data);
    let mut reader = tokio::io::BufReader::new(&mut cursor);
    let decoded = read_response(&mut reader).await.unwrap();
    assert_eq!(decoded.body, b"x");
  }

  #[tokio::test]
  async fn test_decode_rejects_malformed_header() {
    let mut cursor = std::io::Cursor::new(b"banana\n".to_vec());
    let mut reader = tokio::io::BufReader::new(&mut cursor);
    assert!(matches!(
      read_response(&mut reader).await,
      Err(ProtoError::Syntax(_))
    ));
  }

  #[tokio::test]
  async fn test_decode_short_body_is_fatal() {
    let mut cursor = std::io::Cursor::new(b"200 100     \ntoo short\n".to_vec());
    let mut reader = tokio::io::BufReader::new(&mut cursor);
    assert!(matches!(
      read_response(&mut reader).await,
      Err(ProtoError::Io(_))
    ));
  }

  #[test]
  fn test_quote_plain_args() {
    assert_eq!(quote("param.set"), "param.set");
    assert_eq!(quote("a b"), "\"a b\"");
    assert_eq!(quote(""), "\"\"");
  }

  #[test]
  fn test_quote_escapes() {
    assert_eq!(quote("a\\b"), "a\\\\b");
    assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    assert_eq!(quote("a\nb"), "\"a\\nb\"");
    assert_eq!(quote("\x01"), "\\001");
  }

  #[test]
  fn test_split_line_basic() {
    let args = split_line("vcl.use boot").unwrap();
    assert_eq!(args, vec!["vcl.use", "boot"]);

    let args = split_line("  param.set   \"a b\"  c ").unwrap();
    assert_eq!(args, vec!["param.set", "a b", "c"]);
  }

  #[test]
  fn test_split_line_unbalanced_quote() {
    assert!(matches!(
      split_line("vcl.use \"boot"),
      Err(ProtoError::Syntax(_))
    ));
  }

  #[test]
  fn test_unescape_rules() {
    let args = split_line(r#""a\nb" "c\td" "\x41" "\101" "\\n""#).unwrap();
    assert_eq!(args, vec!["a\nb", "c\td", "A", "A", "\\n"]);
  }

  #[test]
  fn test_backslash_resolved_first() {
    // The doubled backslash must not feed the \n rule.
    let args = split_line(r#""\\network""#).unwrap();
    assert_eq!(args, vec!["\\network"]);
  }

  #[test]
  fn test_quote_unquote_roundtrip() {
    let cases: Vec<Vec<&str>> = vec![
      vec!["help"],
      vec!["param.set", "thread_pool_min", "5"],
      vec!["vcl.inline", "cfg", "vcl 4.0;\nbackend b { .host = \"x\"; }"],
      vec!["odd", "a b\tc", "d\\e", "\"quoted\"", ""],
      vec!["ctrl", "\x01\x02\x7f"],
    ];
    for args in cases {
      let line = quote_line(&args);
      let back = split_line(&line).unwrap();
      assert_eq!(back, args, "line was {:?}", line);
    }
  }

  #[test]
  fn test_heredoc_delimiter() {
    assert_eq!(
      heredoc_delimiter("vcl.inline cfg << END"),
      Some(("vcl.inline cfg", "END"))
    );
    assert_eq!(heredoc_delimiter("vcl.use boot"), None);
    assert_eq!(heredoc_delimiter("bad << to ken"), None);
  }

  #[test]
  fn test_heredoc_token_avoids_body() {
    // All 26^8 eight-letter tokens cannot hide in a short body, so the
    // substring check must always terminate with a safe pick.
    let body = "abcdefgh\n".repeat(4);
    for _ in 0..32 {
      let token = heredoc_token(&body);
      assert_eq!(token.len(), 8);
      assert!(!body.contains(&token));
    }
  }

  #[test]
  fn test_format_heredoc_terminates_body() {
    let out = format_heredoc(&["vcl.inline", "cfg"], "line one\nline two");
    let mut lines = out.lines();
    let first = lines.next().unwrap();
    let token = first.rsplit(' ').next().unwrap().to_string();
    assert!(first.starts_with("vcl.inline cfg << "));
    assert_eq!(lines.next(), Some("line one"));
    assert_eq!(lines.next(), Some("line two"));
    assert_eq!(lines.next(), Some(token.as_str()));
    assert!(out.ends_with('\n'));
  }

  #[test]
  fn test_auth_response_is_stable_hex() {
    let a = auth_response("challenge", b"secret\n");
    let b = auth_response("challenge", b"secret\n");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, auth_response("challenge2", b"secret\n"));
  }
}
