// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The relay: accepts worker registrations and forwards callers' requests to them
//!
//! Every inbound connection carries one request head. Registrations upgrade
//! their connection into a [MuxSession]; anything else is routed by its first
//! path segment onto a fresh stream of the named worker's session, after which
//! the relay copies raw bytes in both directions.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as AnyhowContext;
use bytes::BytesMut;
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt},
  net::TcpListener,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;

use crate::{
  common::{
    authentication::RegistrationAuthorizer,
    protocol::{
      http::{
        split_worker_target, write_simple_response, write_switching_protocols, RequestHead,
        RequestHeadError, CLIENT_URL_HEADER, ORIGINAL_PATH_HEADER,
      },
      mux::{MuxConfig, MuxSession, UPGRADE_PROTOCOL},
      tunnel::{registry::SessionRegistry, ArcTunnel, TunnelSide, WorkerId},
    },
  },
  util::{
    cancellation::{drain_tracked_tasks, CancellationListener},
    proxy_generic_tokio_streams,
    tunnel_stream::PrefixedStream,
  },
};

const REGISTRATION_PREFIX: &str = "/register/";

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
  /// Externally reachable base URL of the relay, such as `https://relay.example.com`
  pub public_base_url: Option<String>,
  pub mux: MuxConfig,
}

impl RelayConfig {
  fn client_url(&self, worker_id: &WorkerId) -> Option<String> {
    self
      .public_base_url
      .as_deref()
      .map(|base| format!("{}/{}", base.trim_end_matches('/'), worker_id))
  }
}

#[derive(Debug)]
pub struct RelayGateway {
  config: RelayConfig,
  authorizer: Arc<dyn RegistrationAuthorizer>,
  registry: Arc<SessionRegistry>,
}

impl RelayGateway {
  pub fn new(config: RelayConfig, authorizer: Arc<dyn RegistrationAuthorizer>) -> Arc<Self> {
    Arc::new(Self {
      config,
      authorizer,
      registry: SessionRegistry::new(),
    })
  }

  pub fn registry(&self) -> &Arc<SessionRegistry> {
    &self.registry
  }

  /// Serves a single inbound connection: one registration, or one forwarded request
  #[tracing::instrument(level = "debug", skip(self, io, peer_addr), fields(peer_addr = %peer_addr), err)]
  pub async fn handle_connection<T>(&self, mut io: T, peer_addr: SocketAddr) -> anyhow::Result<()>
  where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let mut buffer = BytesMut::with_capacity(4096);
    let head = match RequestHead::read(&mut io, &mut buffer).await {
      Ok(head) => head,
      Err(RequestHeadError::ConnectionClosed) => {
        tracing::trace!("Connection closed before sending a request");
        return Ok(());
      }
      Err(e @ (RequestHeadError::Malformed(_) | RequestHeadError::TooLarge)) => {
        tracing::debug!(error = %e, "Rejecting unparseable request");
        write_simple_response(&mut io, 400, "Bad Request").await?;
        return Ok(());
      }
      Err(e) => return Err(e).context("Failed reading request head"),
    };

    match head.path().strip_prefix(REGISTRATION_PREFIX) {
      Some(raw_id) => {
        let raw_id = raw_id.to_string();
        self.register(io, buffer, head, &raw_id).await
      }
      None => self.forward(io, buffer, head).await,
    }
  }

  async fn register<T>(
    &self,
    mut io: T,
    buffer: BytesMut,
    head: RequestHead,
    raw_id: &str,
  ) -> anyhow::Result<()>
  where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let worker_id = match WorkerId::parse(raw_id) {
      Ok(worker_id) => worker_id,
      Err(e) => {
        tracing::debug!(error = %e, "Registration for malformed worker ID");
        write_simple_response(&mut io, 400, "Bad Request").await?;
        return Ok(());
      }
    };
    self.register_worker(io, buffer, head, worker_id).await
  }

  #[tracing::instrument(level = "info", name = "registration", skip_all, fields(worker_id = %worker_id))]
  async fn register_worker<T>(
    &self,
    mut io: T,
    buffer: BytesMut,
    head: RequestHead,
    worker_id: WorkerId,
  ) -> anyhow::Result<()>
  where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let wants_mux = head
      .header_str("upgrade")
      .map(|protocol| protocol.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL))
      .unwrap_or(false);
    if !head.is_upgrade() || !wants_mux {
      tracing::debug!("Registration is not a tunnel upgrade request");
      write_simple_response(&mut io, 404, "Not Found").await?;
      return Ok(());
    }
    if let Err(e) = self.authorizer.authorize(&worker_id, &head).await {
      tracing::info!(error = %e, "Registration unauthorized");
      write_simple_response(&mut io, 401, "Unauthorized").await?;
      return Ok(());
    }
    if self.registry.lookup(&worker_id).is_ok() {
      tracing::info!("Registration refused; a live session already holds this ID");
      write_simple_response(&mut io, 409, "Conflict").await?;
      return Ok(());
    }

    let client_url = self.config.client_url(&worker_id);
    let extra_headers: Vec<(&str, &str)> = client_url
      .as_deref()
      .map(|url| vec![(CLIENT_URL_HEADER, url)])
      .unwrap_or_default();
    write_switching_protocols(&mut io, UPGRADE_PROTOCOL, &extra_headers)
      .await
      .context("Failed completing registration upgrade")?;

    let session = MuxSession::new(
      PrefixedStream::new(buffer, io),
      TunnelSide::Listen,
      self.config.mux.clone(),
    );
    let tunnel: ArcTunnel = Arc::new(session);
    match self.registry.register(worker_id.clone(), Arc::clone(&tunnel)) {
      Ok(registered) => {
        tracing::info!(session_id = %registered.session_id(), "Worker registered");
      }
      Err(e) => {
        tracing::info!(error = %e, "Lost registration race; closing the new session");
        tunnel.close().await;
      }
    }
    Ok(())
  }

  async fn forward<T>(&self, mut io: T, buffer: BytesMut, head: RequestHead) -> anyhow::Result<()>
  where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let routed = split_worker_target(&head.target)
      .and_then(|(raw_id, target)| WorkerId::parse(raw_id).ok().map(|id| (id, target)));
    let (worker_id, target) = match routed {
      Some(routed) => routed,
      None => {
        tracing::debug!(request_target = %head.target, "Request names no worker");
        write_simple_response(&mut io, 404, "Not Found").await?;
        return Ok(());
      }
    };
    self.forward_to_worker(io, buffer, head, worker_id, target).await
  }

  #[tracing::instrument(level = "debug", name = "forward", skip_all, fields(worker_id = %worker_id))]
  async fn forward_to_worker<T>(
    &self,
    mut io: T,
    buffer: BytesMut,
    mut head: RequestHead,
    worker_id: WorkerId,
    target: String,
  ) -> anyhow::Result<()>
  where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let session = match self.registry.lookup(&worker_id) {
      Ok(session) => session,
      Err(e) => {
        tracing::debug!(error = %e, "Not forwarding");
        write_simple_response(&mut io, 404, "Not Found").await?;
        return Ok(());
      }
    };
    let mut stream = match session.tunnel().open_link().await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::warn!(error = %e, "Failed to open stream to worker");
        write_simple_response(&mut io, 500, "Internal Server Error").await?;
        return Ok(());
      }
    };

    let original_path = head.path().to_string();
    head.target = target;
    head.set_header(ORIGINAL_PATH_HEADER, original_path);
    if !head.is_upgrade() {
      head.set_header("connection", "close");
    }
    let written = async {
      stream.write_all(&head.to_bytes()).await?;
      stream.write_all(&buffer).await?;
      stream.flush().await
    }
    .await;
    if let Err(e) = written {
      tracing::warn!(error = %e, "Failed to send request to worker");
      write_simple_response(&mut io, 500, "Internal Server Error").await?;
      return Ok(());
    }

    tracing::debug!(request_target = %head.target, "Proxying request");
    match proxy_generic_tokio_streams(io, stream).await {
      Ok(completion) => tracing::debug!(?completion, "Forwarded request finished"),
      Err(e) => tracing::debug!(error = ?e, "Forwarded request ended with error"),
    }
    Ok(())
  }

  /// Accepts connections from `listener` until `shutdown` fires, optionally
  /// terminating TLS first, then waits up to `grace` for in-flight connections
  pub async fn serve(
    self: Arc<Self>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationListener,
    grace: Duration,
  ) -> anyhow::Result<()> {
    let tracker = TaskTracker::new();
    let local_addr = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(%local_addr, tls = tls.is_some(), "Relay listening");
    loop {
      let (socket, peer_addr) = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(e) => {
            tracing::warn!(error = ?e, "Failed accepting connection");
            continue;
          }
        },
      };
      let _ = socket.set_nodelay(true);
      let gateway = Arc::clone(&self);
      let tls = tls.clone();
      tracker.spawn(async move {
        let result = match tls {
          Some(acceptor) => match acceptor.accept(socket).await {
            Ok(stream) => gateway.handle_connection(stream, peer_addr).await,
            Err(e) => Err(e).context("TLS handshake failed"),
          },
          None => gateway.handle_connection(socket, peer_addr).await,
        };
        if let Err(e) = result {
          tracing::debug!(%peer_addr, error = ?e, "Connection ended with error");
        }
      });
    }
    tracing::info!("Relay no longer accepting connections");
    drain_tracked_tasks(&tracker, grace).await;
    Ok(())
  }
}
