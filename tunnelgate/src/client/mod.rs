// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The worker side of a tunnel: registers with a relay and accepts the streams
//! it forwards, re-registering whenever the connection is lost

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

use crate::{
  common::protocol::{
    mux::{lock, MuxSession},
    tunnel::{Tunnel, TunnelDownlink, TunnelMonitoring},
  },
  util::tunnel_stream::WrappedStream,
};

pub mod backoff;
mod configurer;
mod connect;

pub use self::{
  backoff::{AcceptBackoff, BackoffConfig, RetryState},
  configurer::{ClientConfig, Configurer, StaticConfigurer},
  connect::ConnectError,
};
#[cfg(test)]
pub use self::configurer::MockConfigurer;

/// Streams accepted from the relay but not yet taken by [TunnelClient::accept]
const ACCEPTED_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
  #[error("Relay refused registration with status {status}; not retrying")]
  RetryFailed { status: u16 },
  #[error("Gave up reconnecting after {attempts} attempts over {elapsed:?}")]
  RetryTimedOut { attempts: u32, elapsed: Duration },
  #[error("Tunnel client is closed")]
  Closed,
  #[error("Invalid client configuration: {0}")]
  InvalidConfiguration(String),
}

struct Inner {
  configurer: Arc<dyn Configurer>,
  state: watch::Sender<ClientState>,
  session: ArcSwapOption<MuxSession>,
  url: ArcSwap<String>,
  backoff: Mutex<BackoffConfig>,
  accepted_tx: mpsc::Sender<WrappedStream>,
  accepted_rx: tokio::sync::Mutex<mpsc::Receiver<WrappedStream>>,
  failure: Mutex<Option<ClientError>>,
  shutdown: CancellationToken,
  tasks: TaskTracker,
}

impl Inner {
  fn set_state(&self, state: ClientState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      tracing::debug!(from = ?previous, to = ?state, "Client state changed");
    }
  }

  fn terminal_error(&self) -> ClientError {
    lock(&self.failure).clone().unwrap_or(ClientError::Closed)
  }

  /// Connects, retrying transient failures with backoff, until a session is
  /// established, a permanent failure occurs, or the client is closed
  ///
  /// Each attempt is bounded by the configured connect timeout and by the retry
  /// time remaining, so a relay that never answers still ends in
  /// [ClientError::RetryTimedOut].
  async fn establish(&self) -> Result<connect::Connection, ClientError> {
    let mut retry = RetryState::new(lock(&self.backoff).clone());
    let mut attempts = 0u32;
    loop {
      if self.shutdown.is_cancelled() {
        return Err(ClientError::Closed);
      }
      self.set_state(ClientState::Connecting);
      attempts += 1;
      let configured = tokio::select! {
        _ = self.shutdown.cancelled() => return Err(ClientError::Closed),
        configured = self.configurer.configure() => configured,
      };
      let outcome = match configured {
        Ok(config) => {
          *lock(&self.backoff) = config.backoff.clone();
          retry.reconfigure(config.backoff.clone());
          let deadline = std::cmp::min(config.connect_timeout, retry.remaining());
          let attempt = tokio::time::timeout(deadline, connect::connect(&config));
          tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ClientError::Closed),
            attempt = attempt => Ok(attempt.unwrap_or(Err(ConnectError::TimedOut(deadline)))),
          }
        }
        Err(e) => Err(e),
      };
      let error = match outcome {
        Ok(Ok(connection)) => {
          tracing::info!(attempts, url = %connection.url, "Registered with relay");
          return Ok(connection);
        }
        Ok(Err(e)) if e.is_permanent() => {
          tracing::error!(attempts, error = %e, "Registration permanently rejected");
          return Err(match e {
            ConnectError::Rejected(status) => ClientError::RetryFailed {
              status: status.as_u16(),
            },
            other => ClientError::InvalidConfiguration(other.to_string()),
          });
        }
        Ok(Err(e)) => anyhow::Error::new(e),
        Err(e) => e.context("Configurer failed"),
      };
      match retry.next_backoff() {
        Some(delay) => {
          tracing::warn!(attempts, error = ?error, ?delay, "Registration attempt failed; retrying");
          tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ClientError::Closed),
            _ = tokio::time::sleep(delay) => {}
          }
        }
        None => {
          let elapsed = retry.elapsed();
          tracing::error!(attempts, ?elapsed, error = ?error, "Giving up on registration");
          return Err(ClientError::RetryTimedOut { attempts, elapsed });
        }
      }
    }
  }

  fn install(&self, connection: connect::Connection) -> Arc<MuxSession> {
    let session = Arc::new(connection.session);
    self.url.store(Arc::new(connection.url));
    self.session.store(Some(Arc::clone(&session)));
    self.set_state(ClientState::Connected);
    let accept_loop = accept_streams(
      Arc::clone(&session),
      self.accepted_tx.clone(),
      self.shutdown.clone(),
    );
    self.tasks.spawn(accept_loop.in_current_span());
    session
  }

  async fn supervise(self: Arc<Self>, mut session: Arc<MuxSession>) {
    loop {
      let reason = tokio::select! {
        _ = self.shutdown.cancelled() => return,
        reason = session.on_closed() => reason,
      };
      self.session.store(None);
      if self.shutdown.is_cancelled() {
        return;
      }
      tracing::warn!(reason = %reason, "Lost connection to relay; reconnecting");
      self.set_state(ClientState::Reconnecting);
      match self.establish().await {
        Ok(connection) => {
          session = self.install(connection);
          if self.shutdown.is_cancelled() {
            self.session.store(None);
            session.close().await;
            return;
          }
        }
        Err(e) => {
          if e != ClientError::Closed {
            *lock(&self.failure) = Some(e);
          }
          self.set_state(ClientState::Closed);
          self.shutdown.cancel();
          return;
        }
      }
    }
  }
}

/// Hands streams from one session to the client until the session ends
///
/// Transient accept failures back off with [AcceptBackoff]; a closed session
/// ends the loop, leaving reconnection to the supervisor.
async fn accept_streams(
  session: Arc<MuxSession>,
  accepted: mpsc::Sender<WrappedStream>,
  shutdown: CancellationToken,
) {
  let mut backoff = AcceptBackoff::default();
  loop {
    let next = tokio::select! {
      _ = shutdown.cancelled() => return,
      next = session.accept_link() => next,
    };
    match next {
      Ok(stream) => {
        backoff.reset();
        tokio::select! {
          _ = shutdown.cancelled() => return,
          sent = accepted.send(stream) => {
            if sent.is_err() {
              return;
            }
          }
        }
      }
      Err(_) if session.is_closed() => return,
      Err(e) => {
        let delay = backoff.next_delay();
        tracing::debug!(error = %e, ?delay, "Accept failed; backing off");
        tokio::select! {
          _ = shutdown.cancelled() => return,
          _ = tokio::time::sleep(delay) => {}
        }
      }
    }
  }
}

/// A worker's registration with a relay
///
/// Accepted streams outlive the connection that carried them being replaced,
/// but not the client: closing or dropping the client closes its session.
///
/// The [Configurer] is consulted before every connection attempt, so a fresh
/// token is fetched each time the tunnel is re-established. An established
/// registration is never renewed ahead of its token's expiry; the relay only
/// checks the token when the connection is upgraded.
pub struct TunnelClient {
  inner: Arc<Inner>,
}

impl TunnelClient {
  /// Registers with the relay named by `configurer`, retrying per its backoff
  /// settings, and keeps the registration alive until [TunnelClient::close]
  pub async fn connect(configurer: Arc<dyn Configurer>) -> Result<TunnelClient, ClientError> {
    let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPTED_BUFFER);
    let (state, _) = watch::channel(ClientState::Disconnected);
    let inner = Arc::new(Inner {
      configurer,
      state,
      session: ArcSwapOption::empty(),
      url: ArcSwap::from_pointee(String::new()),
      backoff: Mutex::new(BackoffConfig::default()),
      accepted_tx,
      accepted_rx: tokio::sync::Mutex::new(accepted_rx),
      failure: Mutex::new(None),
      shutdown: CancellationToken::new(),
      tasks: TaskTracker::new(),
    });
    let span = tracing::info_span!("tunnel_client");
    let session = match inner.establish().instrument(span.clone()).await {
      Ok(connection) => {
        let _entered = span.enter();
        inner.install(connection)
      }
      Err(e) => {
        inner.set_state(ClientState::Closed);
        return Err(e);
      }
    };
    inner
      .tasks
      .spawn(Arc::clone(&inner).supervise(session).instrument(span));
    Ok(TunnelClient { inner })
  }

  /// Waits for the relay to forward a stream
  ///
  /// Fails once the client is closed or has stopped reconnecting.
  pub async fn accept(&self) -> Result<WrappedStream, ClientError> {
    let mut accepted = self.inner.accepted_rx.lock().await;
    tokio::select! {
      biased;
      _ = self.inner.shutdown.cancelled() => Err(self.inner.terminal_error()),
      stream = accepted.recv() => stream.ok_or_else(|| self.inner.terminal_error()),
    }
  }

  /// The public base URL through which the worker's service is reachable
  pub fn url(&self) -> String {
    self.inner.url.load().as_ref().clone()
  }

  pub fn state(&self) -> ClientState {
    *self.inner.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<ClientState> {
    self.inner.state.subscribe()
  }

  /// Closes the session and stops reconnecting; repeated calls are no-ops
  pub async fn close(&self) {
    self.inner.shutdown.cancel();
    if let Some(session) = self.inner.session.swap(None) {
      session.close().await;
    }
    self.inner.set_state(ClientState::Closed);
    self.inner.tasks.close();
    self.inner.tasks.wait().await;
  }
}

impl std::fmt::Debug for TunnelClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelClient")
      .field("url", &self.url())
      .field("state", &self.state())
      .finish()
  }
}

impl Drop for TunnelClient {
  fn drop(&mut self) {
    self.inner.shutdown.cancel();
    if let Some(session) = self.inner.session.swap(None) {
      // Closing aborts the session immediately; waiting for the final flush is optional
      drop(session.close());
    }
  }
}
