// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::time::SystemTime;

use super::{ArcTunnel, SessionId, WorkerId};

pub mod memory;

pub use self::memory::SessionRegistry;

/// A live registration of a worker's tunnel on the relay
pub struct WorkerSession {
  worker_id: WorkerId,
  session_id: SessionId,
  tunnel: ArcTunnel,
  registered_at: SystemTime,
}

impl WorkerSession {
  pub(crate) fn new(worker_id: WorkerId, session_id: SessionId, tunnel: ArcTunnel) -> Self {
    Self {
      worker_id,
      session_id,
      tunnel,
      registered_at: SystemTime::now(),
    }
  }

  pub fn worker_id(&self) -> &WorkerId {
    &self.worker_id
  }

  pub fn session_id(&self) -> SessionId {
    self.session_id
  }

  pub fn tunnel(&self) -> &ArcTunnel {
    &self.tunnel
  }

  pub fn registered_at(&self) -> SystemTime {
    self.registered_at
  }
}

impl std::fmt::Debug for WorkerSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerSession")
      .field("worker_id", &self.worker_id)
      .field("session_id", &self.session_id)
      .field("registered_at", &self.registered_at)
      .field("closed", &self.tunnel.is_closed())
      .finish()
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
  #[error("A live session is already registered for worker {0}")]
  DuplicateRegistration(WorkerId),
  #[error("No session is registered for worker {0}")]
  SessionNotFound(WorkerId),
}
