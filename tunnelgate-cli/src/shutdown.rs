// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::CancellationToken;

async fn signalled() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut terminate) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {},
          _ = terminate.recv() => {},
        }
      }
      Err(e) => {
        tracing::warn!(error = ?e, "SIGTERM handler unavailable; only watching for interrupt");
        let _ = tokio::signal::ctrl_c().await;
      }
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}

/// A token cancelled on the first interrupt or terminate signal
pub fn shutdown_on_signal() -> CancellationToken {
  let shutdown = CancellationToken::new();
  let trigger = shutdown.clone();
  tokio::spawn(async move {
    signalled().await;
    tracing::info!("Shutdown signal received");
    trigger.cancel();
  });
  shutdown
}
