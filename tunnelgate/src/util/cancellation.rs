// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio_util::{
  sync::{CancellationToken, WaitForCancellationFuture},
  task::TaskTracker,
};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Child tokens can be produced from it, allowing sub-cancellation,
/// but the interface does not expose a way to cancel the inner token.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

impl From<&CancellationToken> for CancellationListener {
  fn from(token: &CancellationToken) -> Self {
    Self {
      token: token.clone(),
    }
  }
}

/// Stops `tracker` from accepting new tasks and waits up to `grace` for the
/// ones already running; returns `false` if any were still running at the deadline
pub async fn drain_tracked_tasks(tracker: &TaskTracker, grace: Duration) -> bool {
  tracker.close();
  let remaining = tracker.len();
  if remaining > 0 {
    tracing::info!(remaining, grace = ?grace, "Waiting for in-flight tasks");
  }
  match tokio::time::timeout(grace, tracker.wait()).await {
    Ok(()) => true,
    Err(_) => {
      tracing::warn!(
        remaining = tracker.len(),
        "Grace period elapsed with tasks still running"
      );
      false
    }
  }
}
