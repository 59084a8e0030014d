// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing_futures::Instrument;

use super::{RegistrationError, WorkerSession};
use crate::common::protocol::tunnel::{
  id::MonotonicAtomicGenerator, ArcTunnel, SessionId, WorkerId,
};

pub type SessionRemovedHook = Box<dyn Fn(&WorkerSession) + Send + Sync + 'static>;

/// The relay's worker ID to session mapping
///
/// Registration is an atomic insert-if-absent on the shard holding the ID, so
/// it excludes concurrent lookups and registrations of that key. Entries are
/// removed only when their transport reports itself closed; a session whose
/// transport has closed but whose cleanup has not yet run is treated as absent.
pub struct SessionRegistry {
  sessions: DashMap<WorkerId, Arc<WorkerSession>>,
  ids: MonotonicAtomicGenerator,
  on_removed: ArcSwapOption<SessionRemovedHook>,
}

impl SessionRegistry {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      sessions: DashMap::new(),
      ids: MonotonicAtomicGenerator::default(),
      on_removed: ArcSwapOption::empty(),
    })
  }

  /// Installs a callback run after a session is removed from the registry
  pub fn on_session_removed(&self, hook: SessionRemovedHook) {
    self.on_removed.store(Some(Arc::new(hook)));
  }

  pub fn register(
    self: &Arc<Self>,
    worker_id: WorkerId,
    tunnel: ArcTunnel,
  ) -> Result<Arc<WorkerSession>, RegistrationError> {
    let session = match self.sessions.entry(worker_id.clone()) {
      Entry::Occupied(mut existing) => {
        if !existing.get().tunnel().is_closed() {
          return Err(RegistrationError::DuplicateRegistration(worker_id));
        }
        tracing::debug!(
          worker_id = %worker_id,
          stale_session = %existing.get().session_id(),
          "Replacing closed session awaiting cleanup"
        );
        let session = Arc::new(WorkerSession::new(worker_id, self.ids.next(), tunnel));
        existing.insert(session.clone());
        session
      }
      Entry::Vacant(vacant) => {
        let session = Arc::new(WorkerSession::new(worker_id, self.ids.next(), tunnel));
        vacant.insert(session.clone());
        session
      }
    };
    self.watch_for_close(&session);
    Ok(session)
  }

  pub fn lookup(&self, worker_id: &WorkerId) -> Result<Arc<WorkerSession>, RegistrationError> {
    match self.sessions.get(worker_id) {
      Some(session) if !session.tunnel().is_closed() => Ok(session.value().clone()),
      _ => Err(RegistrationError::SessionNotFound(worker_id.clone())),
    }
  }

  /// Removes the registration for `worker_id` only if it is still `session_id`
  pub(crate) fn remove(
    &self,
    worker_id: &WorkerId,
    session_id: SessionId,
  ) -> Option<Arc<WorkerSession>> {
    let removed = self
      .sessions
      .remove_if(worker_id, |_, session| session.session_id() == session_id)
      .map(|(_, session)| session);
    if let Some(session) = &removed {
      tracing::info!(worker_id = %worker_id, session_id = %session_id, "Worker session removed");
      if let Some(hook) = self.on_removed.load_full() {
        (**hook)(session);
      }
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  fn watch_for_close(self: &Arc<Self>, session: &Arc<WorkerSession>) {
    let registry: Weak<Self> = Arc::downgrade(self);
    let worker_id = session.worker_id().clone();
    let session_id = session.session_id();
    let closed = session.tunnel().on_closed();
    let span = tracing::span!(
      tracing::Level::DEBUG,
      "session_cleanup",
      worker_id = %worker_id,
      session_id = %session_id
    );
    tokio::spawn(
      async move {
        let reason = closed.await;
        tracing::debug!(reason = %reason, "Worker transport closed");
        if let Some(registry) = registry.upgrade() {
          registry.remove(&worker_id, session_id);
        }
      }
      .instrument(span),
    );
  }
}

impl std::fmt::Debug for SessionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionRegistry")
      .field("sessions", &self.sessions.len())
      .finish_non_exhaustive()
  }
}
