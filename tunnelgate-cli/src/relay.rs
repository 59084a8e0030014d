// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use std::{
  fs::File,
  io::BufReader,
  net::SocketAddr,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tunnelgate::{
  common::{
    authentication::{BearerTokenAuthorizer, TokenValidator},
    protocol::tunnel::registry::WorkerSession,
  },
  server::{RelayConfig, RelayGateway},
  util::cancellation::CancellationListener,
};

use crate::shutdown::shutdown_on_signal;

pub struct RelayArgs {
  pub listen: SocketAddr,
  pub tls: Option<(PathBuf, PathBuf)>,
  pub secret_a: String,
  pub secret_b: String,
  pub audience: Option<String>,
  pub public_url: Option<String>,
  pub grace: Duration,
}

impl std::fmt::Debug for RelayArgs {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RelayArgs")
      .field("listen", &self.listen)
      .field("tls", &self.tls)
      .field("audience", &self.audience)
      .field("public_url", &self.public_url)
      .field("grace", &self.grace)
      .finish_non_exhaustive()
  }
}

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
  let mut cert_reader =
    BufReader::new(File::open(cert_path).context("Failed opening certificate file")?);
  let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)
    .context("Failed parsing certificate PEM")?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
  if certs.is_empty() {
    anyhow::bail!("No certificates found in {}", cert_path.display());
  }

  let mut key_reader =
    BufReader::new(File::open(key_path).context("Failed opening private key file")?);
  let key = loop {
    match rustls_pemfile::read_one(&mut key_reader).context("Failed parsing private key PEM")? {
      Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => break rustls::PrivateKey(key),
      Some(_) => continue,
      None => anyhow::bail!("No private key found in {}", key_path.display()),
    }
  };

  let config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Certificate and private key were rejected")?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}

pub async fn relay_main(config: RelayArgs) -> Result<()> {
  let tls = match &config.tls {
    Some((cert, key)) => Some(load_tls(cert, key)?),
    None => None,
  };
  let listener = TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("Failed binding relay listener on {}", config.listen))?;

  let validator = TokenValidator::new(config.secret_a, config.secret_b).with_audience(config.audience);
  let gateway = RelayGateway::new(
    RelayConfig {
      public_base_url: config.public_url,
      mux: Default::default(),
    },
    Arc::new(BearerTokenAuthorizer::new(validator)),
  );
  gateway
    .registry()
    .on_session_removed(Box::new(|session: &WorkerSession| {
      tracing::info!(
        worker_id = %session.worker_id(),
        session_id = %session.session_id(),
        "Worker session ended"
      );
    }));

  let shutdown = shutdown_on_signal();
  gateway
    .serve(listener, tls, CancellationListener::from(&shutdown), config.grace)
    .await
}
