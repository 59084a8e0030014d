// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod cancellation;
pub mod tunnel_stream;
pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Which leg of a [proxy_generic_tokio_streams] call finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCompletion {
  AToB(u64),
  BToA(u64),
}

/// Copies bytes in both directions between `a` and `b` until either direction
/// reaches EOF or fails, then shuts down both writers.
///
/// The remaining direction is abandoned rather than drained; callers proxying
/// one request/response cycle rely on this to release both connections as soon
/// as either peer is done.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_generic_tokio_streams<A, B>(
  a: A,
  b: B,
) -> Result<ProxyCompletion, std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (reader_a, mut writer_a) = tokio::io::split(a);
  let (reader_b, mut writer_b) = tokio::io::split(b);
  let mut reader_a = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  tracing::trace!("polling");
  let completion = tokio::select! {
    res = tokio::io::copy_buf(&mut reader_a, &mut writer_b) => res.map(ProxyCompletion::AToB),
    res = tokio::io::copy_buf(&mut reader_b, &mut writer_a) => res.map(ProxyCompletion::BToA),
  };
  // Shutdown failures after the fact only mean the peer already went away
  let _ = writer_a.shutdown().await;
  let _ = writer_b.shutdown().await;
  match completion {
    Ok(completion) => Ok(completion),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}

/// Serde adapter encoding a [std::time::Duration] as integer milliseconds
pub mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
  }
}
