//! Client for a cache daemon's administrative port.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::proto::{self, ProtoError, Response, STATUS_AUTH, STATUS_OK};

/// One CLI connection toward (or from) the cache daemon.
///
/// The same type serves outbound connections opened by a console session and
/// inbound master connections the daemon initiates; the protocol spoken on
/// the wire is identical.
pub struct VarnishClient {
  reader: BufReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
  timeout: Duration,
}

impl VarnishClient {
  /// Connect to the daemon and read its greeting.
  pub async fn connect(addr: &str, timeout: Duration) -> Result<(Self, Response), ProtoError> {
    let stream = TcpStream::connect(addr).await?;
    Self::adopt(stream, timeout).await
  }

  /// Wrap an already-established stream and read the greeting. Used for the
  /// master connections the daemon opens toward the gateway.
  pub async fn adopt(stream: TcpStream, timeout: Duration) -> Result<(Self, Response), ProtoError> {
    let (read_half, write_half) = stream.into_split();
    let mut client = Self {
      reader: BufReader::new(read_half),
      writer: write_half,
      timeout,
    };
    let greeting = client.read_response().await?;
    Ok((client, greeting))
  }

  /// Answer an AUTH greeting with the challenge/response digest.
  pub async fn authenticate(
    &mut self,
    greeting: &Response,
    secret: &[u8],
  ) -> Result<Response, ProtoError> {
    let challenge = greeting.first_line();
    let line = format!("auth {}", proto::auth_response(&challenge, secret));
    self.ask(&line).await
  }

  /// Complete the greeting handshake. Returns the final status frame and
  /// whether the peer accepted our credentials.
  pub async fn login(
    &mut self,
    greeting: Response,
    secret: Option<&[u8]>,
  ) -> Result<(Response, bool), ProtoError> {
    if greeting.status != STATUS_AUTH {
      return Ok((greeting, false));
    }
    let Some(secret) = secret else {
      return Ok((greeting, false));
    };
    let resp = self.authenticate(&greeting, secret).await?;
    let authenticated = resp.status == STATUS_OK;
    Ok((resp, authenticated))
  }

  /// Send one command line and read the response.
  pub async fn ask(&mut self, line: &str) -> Result<Response, ProtoError> {
    self.send_line(line).await?;
    self.read_response().await
  }

  pub async fn send_line(&mut self, line: &str) -> Result<(), ProtoError> {
    self.writer.write_all(line.as_bytes()).await?;
    self.writer.write_all(b"\n").await?;
    self.writer.flush().await?;
    Ok(())
  }

  /// Relay pre-formatted protocol bytes (a raw console command, possibly
  /// spanning a here-document) without reinterpretation.
  pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtoError> {
    self.writer.write_all(bytes).await?;
    self.writer.flush().await?;
    Ok(())
  }

  /// Read one response frame within the configured timeout.
  pub async fn read_response(&mut self) -> Result<Response, ProtoError> {
    match tokio::time::timeout(self.timeout, proto::read_response(&mut self.reader)).await {
      Ok(result) => result,
      Err(_) => Err(ProtoError::Timeout),
    }
  }

  /// Wait until the daemon has sent something; 0 means it closed the
  /// connection. Cancel safe, for use inside `select!`.
  pub async fn readable(&mut self) -> std::io::Result<usize> {
    proto::readable(&mut self.reader).await
  }

  /// Read one raw line, without a timeout. `None` at end of stream.
  pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = self.reader.read_line(&mut line).await?;
    if n == 0 {
      Ok(None)
    } else {
      Ok(Some(line))
    }
  }
}
