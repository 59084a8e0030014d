// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Minimal HTTP/1.x request-head handling for connections the relay takes over
//!
//! The relay never hands callers to a request/response server; it reads just the
//! head, decides where the connection goes, and from then on moves raw bytes.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEAD_LEN: usize = 64 * 1024;
pub const MAX_HEADERS: usize = 100;

pub const ORIGINAL_PATH_HEADER: &str = "x-tunnel-original-path";
pub const CLIENT_URL_HEADER: &str = "x-tunnel-client-url";

#[derive(thiserror::Error, Debug)]
pub enum RequestHeadError {
  #[error("Connection closed before a complete request head arrived")]
  ConnectionClosed,
  #[error("Request head exceeded {MAX_HEAD_LEN} bytes")]
  TooLarge,
  #[error("Malformed request head")]
  Malformed(
    #[from]
    #[source]
    httparse::Error,
  ),
  #[error("Request head I/O failed")]
  Io(
    #[from]
    #[source]
    std::io::Error,
  ),
}

/// A parsed request line and header block, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
  pub method: String,
  pub target: String,
  /// Minor version of HTTP/1.x
  pub version: u8,
  pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
  /// Reads from `reader` until a full request head is buffered and parses it
  ///
  /// Any bytes following the head (the start of a body, or pipelined data) are
  /// left in `buffer` for the caller to forward.
  pub async fn read<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
  ) -> Result<RequestHead, RequestHeadError> {
    loop {
      if !buffer.is_empty() {
        if let Some(head) = Self::parse(buffer)? {
          return Ok(head);
        }
      }
      if buffer.len() >= MAX_HEAD_LEN {
        return Err(RequestHeadError::TooLarge);
      }
      buffer.reserve(4096);
      if reader.read_buf(buffer).await? == 0 {
        return Err(RequestHeadError::ConnectionClosed);
      }
    }
  }

  fn parse(buffer: &mut BytesMut) -> Result<Option<RequestHead>, RequestHeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let consumed = match request.parse(&buffer[..])? {
      httparse::Status::Partial => return Ok(None),
      httparse::Status::Complete(consumed) => consumed,
    };
    if consumed > MAX_HEAD_LEN {
      return Err(RequestHeadError::TooLarge);
    }
    let head = RequestHead {
      method: request.method.unwrap_or_default().to_string(),
      target: request.path.unwrap_or_default().to_string(),
      version: request.version.unwrap_or(1),
      headers: request
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect(),
    };
    let _ = buffer.split_to(consumed);
    Ok(Some(head))
  }

  /// The path component of the request target, without its query
  pub fn path(&self) -> &str {
    self.target.split('?').next().unwrap_or_default()
  }

  pub fn header(&self, name: &str) -> Option<&[u8]> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_slice())
  }

  pub fn header_str(&self, name: &str) -> Option<&str> {
    self.header(name).and_then(|v| std::str::from_utf8(v).ok())
  }

  /// Replaces every header named `name` with a single header holding `value`
  pub fn set_header(&mut self, name: &str, value: impl Into<Vec<u8>>) {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
  }

  /// If the request asks to switch protocols with `Connection: upgrade` and `Upgrade`
  pub fn is_upgrade(&self) -> bool {
    let connection_upgrade = self
      .headers
      .iter()
      .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
      .filter_map(|(_, v)| std::str::from_utf8(v).ok())
      .flat_map(|v| v.split(','))
      .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && self.header("upgrade").is_some()
  }

  /// The credential of an `Authorization: Bearer <token>` header, if present
  pub fn bearer_token(&self) -> Option<&str> {
    let value = self.header_str("authorization")?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
      Some(token.trim())
    } else {
      None
    }
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(self.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(self.target.as_bytes());
    out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
    for (name, value) in &self.headers {
      out.extend_from_slice(name.as_bytes());
      out.extend_from_slice(b": ");
      out.extend_from_slice(value);
      out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
  }
}

/// Splits `/<worker>/<rest>?<query>` into the worker segment and the target to forward
///
/// A bare `/<worker>` or `/<worker>/` forwards as `/`. Returns `None` when the
/// first segment is empty.
pub fn split_worker_target(target: &str) -> Option<(&str, String)> {
  let rest = target.strip_prefix('/')?;
  let (path, query) = match rest.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (rest, None),
  };
  let (worker, remainder) = match path.split_once('/') {
    Some((worker, remainder)) => (worker, remainder),
    None => (path, ""),
  };
  if worker.is_empty() {
    return None;
  }
  let mut forwarded = format!("/{remainder}");
  if let Some(query) = query {
    forwarded.push('?');
    forwarded.push_str(query);
  }
  Some((worker, forwarded))
}

fn reason_phrase(status: u16) -> &'static str {
  match status {
    101 => "Switching Protocols",
    400 => "Bad Request",
    401 => "Unauthorized",
    404 => "Not Found",
    409 => "Conflict",
    500 => "Internal Server Error",
    _ => "Unknown",
  }
}

/// Writes a complete `text/plain` response that closes the connection
pub async fn write_simple_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: u16,
  body: &str,
) -> Result<(), std::io::Error> {
  let response = format!(
    "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {len}\r\nconnection: close\r\n\r\n{body}",
    reason = reason_phrase(status),
    len = body.len(),
  );
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await?;
  // A peer that already hung up leaves nothing to shut down
  let _ = writer.shutdown().await;
  Ok(())
}

/// Writes a `101 Switching Protocols` response; the connection then belongs to `protocol`
pub async fn write_switching_protocols<W: AsyncWrite + Unpin>(
  writer: &mut W,
  protocol: &str,
  extra_headers: &[(&str, &str)],
) -> Result<(), std::io::Error> {
  let mut response = format!(
    "HTTP/1.1 101 {}\r\nconnection: upgrade\r\nupgrade: {protocol}\r\n",
    reason_phrase(101)
  );
  for (name, value) in extra_headers {
    response.push_str(name);
    response.push_str(": ");
    response.push_str(value);
    response.push_str("\r\n");
  }
  response.push_str("\r\n");
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await
}

#[cfg(test)]
mod tests {
  use bytes::BytesMut;
  use tokio::io::AsyncWriteExt;

  use super::{split_worker_target, RequestHead, RequestHeadError};

  #[test]
  fn worker_target_split() {
    let cases = [
      ("/W1/status", Some(("W1", "/status"))),
      ("/W1/a/b?x=1", Some(("W1", "/a/b?x=1"))),
      ("/W1", Some(("W1", "/"))),
      ("/W1/", Some(("W1", "/"))),
      ("/W1?x=1", Some(("W1", "/?x=1"))),
      ("/", None),
      ("//x", None),
      ("*", None),
    ];
    for (input, expected) in cases {
      let actual = split_worker_target(input);
      assert_eq!(
        actual.as_ref().map(|(w, t)| (*w, t.as_str())),
        expected,
        "splitting {input}"
      );
    }
  }

  #[tokio::test]
  async fn reads_head_and_keeps_body_bytes() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client
      .write_all(b"POST /W1/upload?x=1 HTTP/1.1\r\nHost: relay\r\nContent-Length: 5\r\n\r\nhel")
      .await
      .unwrap();
    let mut buffer = BytesMut::new();
    let head = RequestHead::read(&mut server, &mut buffer).await.unwrap();
    assert_eq!(head.method, "POST");
    assert_eq!(head.target, "/W1/upload?x=1");
    assert_eq!(head.path(), "/W1/upload");
    assert_eq!(head.header_str("host"), Some("relay"));
    assert_eq!(&buffer[..], b"hel");
  }

  #[tokio::test]
  async fn head_split_across_reads() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let reader = tokio::spawn(async move {
      let mut buffer = BytesMut::new();
      RequestHead::read(&mut server, &mut buffer).await
    });
    client.write_all(b"GET /W1/status HT").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.write_all(b"TP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let head = reader.await.unwrap().unwrap();
    assert_eq!(head.target, "/W1/status");
  }

  #[tokio::test]
  async fn malformed_and_truncated_heads_fail() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"GARBAGE\x01\r\n\r\n").await.unwrap();
    let mut buffer = BytesMut::new();
    assert!(matches!(
      RequestHead::read(&mut server, &mut buffer).await,
      Err(RequestHeadError::Malformed(_))
    ));

    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    drop(client);
    let mut buffer = BytesMut::new();
    assert!(matches!(
      RequestHead::read(&mut server, &mut buffer).await,
      Err(RequestHeadError::ConnectionClosed)
    ));
  }

  #[test]
  fn upgrade_and_bearer_detection() {
    let head = RequestHead {
      method: "GET".into(),
      target: "/register/W1".into(),
      version: 1,
      headers: vec![
        ("Connection".into(), b"keep-alive, Upgrade".to_vec()),
        ("Upgrade".into(), b"tunnelgate-mux".to_vec()),
        ("Authorization".into(), b"Bearer abc.def.ghi".to_vec()),
      ],
    };
    assert!(head.is_upgrade());
    assert_eq!(head.bearer_token(), Some("abc.def.ghi"));

    let mut plain = head.clone();
    plain.set_header("connection", "close");
    plain.set_header("authorization", "Basic xyz");
    assert!(!plain.is_upgrade());
    assert_eq!(plain.bearer_token(), None);
  }

  #[test]
  fn serialization_preserves_headers() {
    let mut head = RequestHead {
      method: "GET".into(),
      target: "/status".into(),
      version: 1,
      headers: vec![("Host".into(), b"relay".to_vec())],
    };
    head.set_header("x-tunnel-original-path", "/W1/status");
    assert_eq!(
      head.to_bytes(),
      b"GET /status HTTP/1.1\r\nHost: relay\r\nx-tunnel-original-path: /W1/status\r\n\r\n".to_vec()
    );
  }
}
