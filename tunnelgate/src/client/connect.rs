// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One registration attempt: dial the relay, upgrade, and start a multiplexed session

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
  header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE},
  Method, Request, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::configurer::ClientConfig;
use crate::{
  common::protocol::{
    http::CLIENT_URL_HEADER,
    mux::{MuxSession, UPGRADE_PROTOCOL},
    tunnel::TunnelSide,
  },
  util::tunnel_stream::WrappedStream,
};

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("Relay address {0:?} is not an http or https URL with a host")]
  InvalidAddress(String),
  #[error("Relay rejected registration with status {0}")]
  Rejected(StatusCode),
  #[error("Relay answered registration with status {0}")]
  Unavailable(StatusCode),
  #[error("Failed to reach relay")]
  Network(#[source] std::io::Error),
  #[error("TLS setup failed")]
  Tls(#[source] std::io::Error),
  #[error("Registration attempt did not complete within {0:?}")]
  TimedOut(Duration),
  #[error("HTTP exchange with relay failed")]
  Http(
    #[from]
    #[source]
    hyper::Error,
  ),
}

impl ConnectError {
  /// Permanent failures mean retrying with the same credentials cannot succeed
  ///
  /// `409 Conflict` is excluded: a stale session for this worker is evicted by
  /// the relay once its keep-alive lapses.
  pub fn is_permanent(&self) -> bool {
    match self {
      ConnectError::InvalidAddress(_) => true,
      ConnectError::Rejected(status) => *status != StatusCode::CONFLICT,
      _ => false,
    }
  }
}

/// A live registration with a relay
pub struct Connection {
  pub session: MuxSession,
  pub url: String,
}

struct RelayTarget {
  tls: bool,
  host: String,
  port: u16,
  authority: String,
}

fn parse_relay_address(address: &str) -> Result<RelayTarget, ConnectError> {
  let invalid = || ConnectError::InvalidAddress(address.to_string());
  let uri: Uri = address.parse().map_err(|_| invalid())?;
  let tls = match uri.scheme_str() {
    Some("https") => true,
    Some("http") => false,
    _ => return Err(invalid()),
  };
  let authority = uri.authority().ok_or_else(invalid)?;
  let host = authority
    .host()
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_string();
  if host.is_empty() {
    return Err(invalid());
  }
  Ok(RelayTarget {
    tls,
    port: authority.port_u16().unwrap_or(if tls { 443 } else { 80 }),
    authority: authority.as_str().to_string(),
    host,
  })
}

fn tls_connector() -> Result<TlsConnector, ConnectError> {
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_native_certs::load_native_certs().map_err(ConnectError::Tls)? {
    if let Err(e) = roots.add(&rustls::Certificate(cert.0)) {
      tracing::trace!(error = %e, "Skipping unusable native root certificate");
    }
  }
  let config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  Ok(TlsConnector::from(Arc::new(config)))
}

async fn dial(target: &RelayTarget) -> Result<WrappedStream, ConnectError> {
  let tcp = TcpStream::connect((target.host.as_str(), target.port))
    .await
    .map_err(ConnectError::Network)?;
  let _ = tcp.set_nodelay(true);
  if !target.tls {
    return Ok(Box::new(tcp));
  }
  let server_name = rustls::ServerName::try_from(target.host.as_str()).map_err(|e| {
    ConnectError::Tls(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
  })?;
  let stream = tls_connector()?
    .connect(server_name, tcp)
    .await
    .map_err(ConnectError::Network)?;
  Ok(Box::new(stream))
}

/// Registers `config.id` with the relay and wraps the upgraded connection as
/// the accepting side of a [MuxSession]
#[tracing::instrument(level = "debug", skip(config), fields(worker_id = %config.id, relay = %config.relay_address))]
pub async fn connect(config: &ClientConfig) -> Result<Connection, ConnectError> {
  let target = parse_relay_address(&config.relay_address)?;
  let io = dial(&target).await?;
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
  // An abandoned attempt must not leave the connection task holding the socket
  let abandoned = CancellationToken::new();
  let _abandon_on_drop = abandoned.clone().drop_guard();
  tokio::spawn(
    async move {
      tokio::select! {
        _ = abandoned.cancelled() => tracing::trace!("Registration attempt abandoned"),
        res = conn.with_upgrades() => {
          if let Err(e) = res {
            tracing::debug!(error = %e, "Relay HTTP connection ended with error");
          }
        }
      }
    }
    .in_current_span(),
  );

  let request = Request::builder()
    .method(Method::GET)
    .uri(format!("/register/{}", config.id))
    .header(HOST, target.authority.as_str())
    .header(CONNECTION, "upgrade")
    .header(UPGRADE, UPGRADE_PROTOCOL)
    .header(AUTHORIZATION, format!("Bearer {}", config.token))
    .body(Empty::<Bytes>::new())
    .map_err(|_| ConnectError::InvalidAddress(config.relay_address.clone()))?;
  let response = sender.send_request(request).await?;

  let status = response.status();
  if status != StatusCode::SWITCHING_PROTOCOLS {
    return Err(if status.is_client_error() {
      ConnectError::Rejected(status)
    } else {
      ConnectError::Unavailable(status)
    });
  }
  let url = response
    .headers()
    .get(CLIENT_URL_HEADER)
    .and_then(|value| value.to_str().ok())
    .map(str::to_string)
    .unwrap_or_else(|| config.default_url());
  let upgraded = hyper::upgrade::on(response).await?;
  let session = MuxSession::new(
    TokioIo::new(upgraded),
    TunnelSide::Connect,
    config.mux.clone(),
  );
  tracing::debug!(%url, "Registration upgraded");
  Ok(Connection { session, url })
}
