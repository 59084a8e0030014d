// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Connects streams accepted through a tunnel to a service on the worker's host

use std::{net::SocketAddr, time::Duration};

use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tracing_futures::Instrument;

use crate::{
  client::{ClientError, TunnelClient},
  util::{
    cancellation::{drain_tracked_tasks, CancellationListener},
    proxy_generic_tokio_streams,
    tunnel_stream::WrappedStream,
    ProxyCompletion,
  },
};

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
  #[error("Failed to dial local service at {target}")]
  Dial {
    target: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("Proxying between tunnel stream and local service failed")]
  Proxy(#[source] std::io::Error),
}

/// Forwards each accepted tunnel stream to one local TCP address
///
/// Every forward runs as a tracked task so shutdown can wait for in-flight
/// connections to finish.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
  target: SocketAddr,
  tracker: TaskTracker,
}

impl LocalForwarder {
  pub fn new(target: SocketAddr) -> Self {
    Self {
      target,
      tracker: TaskTracker::new(),
    }
  }

  pub fn target(&self) -> SocketAddr {
    self.target
  }

  /// Dials the local service and proxies `stream` to it until either side finishes
  ///
  /// A failed dial drops the stream, resetting it for the remote caller.
  pub async fn forward(&self, stream: WrappedStream) -> Result<ProxyCompletion, ForwardError> {
    let local = match TcpStream::connect(self.target).await {
      Ok(local) => local,
      Err(source) => {
        drop(stream);
        return Err(ForwardError::Dial {
          target: self.target,
          source,
        });
      }
    };
    let _ = local.set_nodelay(true);
    proxy_generic_tokio_streams(stream, local)
      .await
      .map_err(ForwardError::Proxy)
  }

  /// Spawns a tracked forward of `stream`
  pub fn spawn_forward(&self, stream: WrappedStream) {
    let this = self.clone();
    let span = tracing::debug_span!("forward", target = %self.target);
    self.tracker.spawn(
      async move {
        match this.forward(stream).await {
          Ok(completion) => tracing::debug!(?completion, "Forward finished"),
          Err(e @ ForwardError::Dial { .. }) => {
            tracing::warn!(error = %e, source = ?std::error::Error::source(&e), "Abandoning forward")
          }
          Err(e) => tracing::debug!(error = ?e, "Forward ended with error"),
        }
      }
      .instrument(span),
    );
  }

  /// Forwards every stream `client` accepts until `shutdown` fires or the client
  /// stops for good
  ///
  /// A client closed locally ends the loop cleanly; exhausted or rejected
  /// reconnection is returned to the caller.
  pub async fn run(
    &self,
    client: &TunnelClient,
    shutdown: CancellationListener,
  ) -> Result<(), ClientError> {
    loop {
      let accepted = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accepted = client.accept() => accepted,
      };
      match accepted {
        Ok(stream) => self.spawn_forward(stream),
        Err(ClientError::Closed) => return Ok(()),
        Err(e) => return Err(e),
      }
    }
  }

  pub fn in_flight(&self) -> usize {
    self.tracker.len()
  }

  /// Waits up to `grace` for in-flight forwards; returns `false` if some were cut off
  pub async fn drain(&self, grace: Duration) -> bool {
    drain_tracked_tasks(&self.tracker, grace).await
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
  };

  use super::{ForwardError, LocalForwarder};

  async fn echo_listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
  }

  #[tokio::test]
  async fn stream_bytes_reach_local_service_and_back() {
    let (listener, addr) = echo_listener().await;
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 5];
      socket.read_exact(&mut buf).await.unwrap();
      socket.write_all(&buf).await.unwrap();
      socket.shutdown().await.unwrap();
    });

    let forwarder = LocalForwarder::new(addr);
    let (mut remote, stream) = duplex(1024);
    forwarder.spawn_forward(Box::new(stream));
    remote.write_all(b"hello").await.unwrap();
    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut echoed))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(echoed, b"hello");
    assert!(forwarder.drain(Duration::from_secs(5)).await);
    assert_eq!(forwarder.in_flight(), 0);
  }

  #[tokio::test]
  async fn failed_dial_abandons_the_stream() {
    let (listener, addr) = echo_listener().await;
    drop(listener);

    let forwarder = LocalForwarder::new(addr);
    let (mut remote, stream) = duplex(1024);
    let result = forwarder.forward(Box::new(stream)).await;
    assert!(matches!(result, Err(ForwardError::Dial { target, .. }) if target == addr));
    let mut rest = Vec::new();
    assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn drain_gives_up_after_grace() {
    let (listener, addr) = echo_listener().await;
    let forwarder = LocalForwarder::new(addr);
    let (_remote, stream) = duplex(1024);
    forwarder.spawn_forward(Box::new(stream));
    // The local service accepts but never answers, keeping the forward open
    let (_held, _) = listener.accept().await.unwrap();
    assert_eq!(forwarder.in_flight(), 1);
    assert!(!forwarder.drain(Duration::from_millis(50)).await);
  }
}
