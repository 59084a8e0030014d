// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use super::backoff::BackoffConfig;
use crate::common::protocol::{mux::MuxConfig, tunnel::WorkerId};

/// Everything needed for one registration attempt with a relay
#[derive(Clone)]
pub struct ClientConfig {
  pub id: WorkerId,
  pub token: String,
  /// Base URL of the relay, such as `https://relay.example.com`
  pub relay_address: String,
  pub backoff: BackoffConfig,
  /// Longest a single registration attempt may take, from dial to upgrade
  pub connect_timeout: Duration,
  pub mux: MuxConfig,
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

impl ClientConfig {
  pub fn new(id: WorkerId, token: impl Into<String>, relay_address: impl Into<String>) -> Self {
    Self {
      id,
      token: token.into(),
      relay_address: relay_address.into(),
      backoff: Default::default(),
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      mux: Default::default(),
    }
  }

  /// The URL the worker is reachable at when the relay does not announce one
  pub fn default_url(&self) -> String {
    format!("{}/{}", self.relay_address.trim_end_matches('/'), self.id)
  }
}

impl std::fmt::Debug for ClientConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientConfig")
      .field("id", &self.id)
      .field("relay_address", &self.relay_address)
      .field("backoff", &self.backoff)
      .field("connect_timeout", &self.connect_timeout)
      .field("mux", &self.mux)
      .finish_non_exhaustive()
  }
}

/// Supplies client configuration on demand
///
/// Called before every connection attempt, so implementations can hand out a
/// freshly issued token each time the tunnel is re-established.
#[cfg_attr(test, mockall::automock)]
pub trait Configurer: Send + Sync {
  fn configure(&self) -> BoxFuture<'static, anyhow::Result<ClientConfig>>;
}

/// A [Configurer] that always returns the same configuration
#[derive(Debug, Clone)]
pub struct StaticConfigurer(pub ClientConfig);

impl Configurer for StaticConfigurer {
  fn configure(&self) -> BoxFuture<'static, anyhow::Result<ClientConfig>> {
    futures::future::ready(Ok(self.0.clone())).boxed()
  }
}
