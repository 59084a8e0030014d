// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex stream abstracting over a connection, allowing use of memory streams,
/// TCP or TLS sockets, and multiplexed logical streams interchangeably
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> TunnelStream for T {}

pub type WrappedStream = Box<dyn TunnelStream + 'static>;

pin_project_lite::pin_project! {
  /// Replays bytes that were read ahead of a protocol switch before reading from `inner`
  ///
  /// Writes pass straight through to `inner`.
  #[derive(Debug)]
  pub struct PrefixedStream<T> {
    prefix: BytesMut,
    #[pin]
    inner: T,
  }
}

impl<T> PrefixedStream<T> {
  pub fn new(prefix: BytesMut, inner: T) -> Self {
    Self { prefix, inner }
  }

  pub fn into_parts(self) -> (BytesMut, T) {
    (self.prefix, self.inner)
  }
}

impl<T: AsyncRead> AsyncRead for PrefixedStream<T> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();
    if !this.prefix.is_empty() {
      let len = std::cmp::min(this.prefix.len(), buf.remaining());
      buf.put_slice(&this.prefix[..len]);
      this.prefix.advance(len);
      return Poll::Ready(Ok(()));
    }
    this.inner.poll_read(cx, buf)
  }
}

impl<T: AsyncWrite> AsyncWrite for PrefixedStream<T> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use bytes::BytesMut;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::PrefixedStream;

  #[tokio::test]
  async fn prefix_is_read_before_inner() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut stream = PrefixedStream::new(BytesMut::from(&b"hello "[..]), near);
    far.write_all(b"world").await.unwrap();
    far.shutdown().await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }
}
