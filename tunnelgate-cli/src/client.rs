// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use futures::{
  future::{BoxFuture, FutureExt},
  StreamExt,
};
use std::{
  net::{Ipv4Addr, SocketAddr},
  path::PathBuf,
  sync::Arc,
  time::Duration,
};
use tokio_stream::wrappers::WatchStream;
use tunnelgate::{
  client::{ClientConfig, Configurer, StaticConfigurer, TunnelClient},
  common::protocol::{proxy_tcp::LocalForwarder, tunnel::WorkerId},
  util::cancellation::CancellationListener,
};

use crate::shutdown::shutdown_on_signal;

#[derive(Clone, Debug)]
pub enum TokenSource {
  Static(String),
  File(PathBuf),
}

pub struct ClientArgs {
  pub relay: String,
  pub id: WorkerId,
  pub token: TokenSource,
  pub port: u16,
  pub url_file: Option<PathBuf>,
  pub grace: Duration,
}

impl std::fmt::Debug for ClientArgs {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let token = match &self.token {
      TokenSource::Static(_) => "<inline>".to_string(),
      TokenSource::File(path) => path.display().to_string(),
    };
    f.debug_struct("ClientArgs")
      .field("relay", &self.relay)
      .field("id", &self.id)
      .field("token", &token)
      .field("port", &self.port)
      .field("url_file", &self.url_file)
      .field("grace", &self.grace)
      .finish()
  }
}

/// Re-reads the token file for each registration, so an external issuer can
/// rotate it in place
struct TokenFileConfigurer {
  base: ClientConfig,
  path: PathBuf,
}

impl Configurer for TokenFileConfigurer {
  fn configure(&self) -> BoxFuture<'static, Result<ClientConfig>> {
    let mut config = self.base.clone();
    let path = self.path.clone();
    async move {
      let token = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed reading token file {}", path.display()))?;
      config.token = token.trim().to_string();
      Ok(config)
    }
    .boxed()
  }
}

pub async fn client_main(config: ClientArgs) -> Result<()> {
  let base = ClientConfig::new(config.id.clone(), String::new(), config.relay.clone());
  let configurer: Arc<dyn Configurer> = match config.token.clone() {
    TokenSource::Static(token) => Arc::new(StaticConfigurer(ClientConfig { token, ..base })),
    TokenSource::File(path) => Arc::new(TokenFileConfigurer { base, path }),
  };

  let shutdown = shutdown_on_signal();
  let client = tokio::select! {
    _ = shutdown.cancelled() => return Ok(()),
    client = TunnelClient::connect(configurer) => client.context("Failed to register with relay")?,
  };
  tracing::info!(url = %client.url(), "Worker is reachable through the relay");
  if let Some(path) = &config.url_file {
    tokio::fs::write(path, client.url())
      .await
      .with_context(|| format!("Failed writing URL file {}", path.display()))?;
  }
  tokio::spawn(WatchStream::new(client.watch_state()).for_each(|state| async move {
    tracing::info!(?state, "Tunnel state");
  }));

  let target = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
  let forwarder = LocalForwarder::new(target);
  tracing::info!(%target, "Forwarding tunnel streams");
  let result = forwarder
    .run(&client, CancellationListener::from(&shutdown))
    .await;

  tracing::info!("Disconnecting...");
  forwarder.drain(config.grace).await;
  client.close().await;
  result.context("Tunnel client stopped")
}
