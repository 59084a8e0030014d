// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

#![warn(unused_imports, dead_code, unused_variables)]

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserializer, Serializer};

use crate::util::tunnel_stream::WrappedStream;

pub mod id;
pub mod registry;

pub use self::id::SessionId;
pub type ArcTunnel = Arc<dyn Tunnel + Send + Sync + 'static>;

pub mod prelude {
  pub use super::{
    ArcTunnel, SessionId, Sided, Tunnel, TunnelDownlink, TunnelError, TunnelMonitoring,
    TunnelSide, TunnelUplink, WorkerId,
  };
}

/// Identifies a worker; the first path segment of every request forwarded to it
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct WorkerId(Arc<str>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Worker ID {0:?} must be non-empty and contain only [a-zA-Z0-9_~.%-]")]
pub struct InvalidWorkerId(pub String);

impl WorkerId {
  pub fn parse<T: AsRef<str>>(raw: T) -> Result<WorkerId, InvalidWorkerId> {
    let raw = raw.as_ref();
    let valid = !raw.is_empty()
      && raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'~' | b'.' | b'%' | b'-'));
    if valid {
      Ok(WorkerId(raw.into()))
    } else {
      Err(InvalidWorkerId(raw.to_string()))
    }
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for WorkerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::fmt::Debug for WorkerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("WorkerId").field(&self.0).finish()
  }
}

impl serde::Serialize for WorkerId {
  fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> serde::de::Deserialize<'de> for WorkerId {
  fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    WorkerId::parse(s).map_err(serde::de::Error::custom)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection timed out waiting for keep-alive")]
  TimedOut,
  #[error("Remote did not accept the stream before the deadline")]
  AcceptTimeout,
  #[error("Stream reset by remote")]
  StreamReset,
  #[error("Protocol violation: {0}")]
  ProtocolViolation(&'static str),
  #[error("Transport error encountered: {0}")]
  TransportError(Arc<str>),
  #[error("Connection closed locally")]
  LocallyClosed,
}

impl From<TunnelError> for std::io::Error {
  fn from(e: TunnelError) -> Self {
    let kind = match &e {
      TunnelError::StreamReset => std::io::ErrorKind::ConnectionReset,
      TunnelError::TimedOut | TunnelError::AcceptTimeout => std::io::ErrorKind::TimedOut,
      TunnelError::LocallyClosed | TunnelError::ConnectionClosed => {
        std::io::ErrorKind::ConnectionAborted
      }
      TunnelError::ProtocolViolation(_) => std::io::ErrorKind::InvalidData,
      TunnelError::TransportError(_) => std::io::ErrorKind::Other,
    };
    std::io::Error::new(kind, e)
  }
}

/// Which end of the physical connection a transport was created on
///
/// The relay listens for registrations and opens streams; the worker connects
/// and accepts them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TunnelSide {
  Connect,
  Listen,
}

pub trait Sided {
  fn side(&self) -> TunnelSide;
}

pub trait TunnelUplink {
  /// Opens a new logical stream to the remote peer
  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>>;
}

pub trait TunnelDownlink {
  /// Waits for the remote peer to open a logical stream
  fn accept_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>>;
}

pub trait TunnelMonitoring {
  /// If the physical connection underneath the tunnel has closed
  fn is_closed(&self) -> bool;

  /// Notifies when the tunnel is closed, and why
  fn on_closed(&self) -> BoxFuture<'static, TunnelError>;
}

/// A multiplexed transport capable of carrying many logical streams over one connection
pub trait Tunnel: TunnelUplink + TunnelDownlink + TunnelMonitoring + Sided {
  /// Closes the tunnel and every logical stream on it; idempotent
  fn close(&self) -> BoxFuture<'static, ()>;
}
