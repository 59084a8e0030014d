// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::BoxFuture;

use super::{AuthenticationError, TunnelClaims};
use crate::common::protocol::{http::RequestHead, tunnel::WorkerId};

/// Decides whether a registration request may claim a worker ID
///
/// The relay consults this for every registration; there is no permissive default.
pub trait RegistrationAuthorizer: std::fmt::Debug + Send + Sync {
  fn authorize<'a>(
    &'a self,
    worker_id: &'a WorkerId,
    request: &'a RequestHead,
  ) -> BoxFuture<'a, Result<TunnelClaims, AuthenticationError>>;
}

impl<T: RegistrationAuthorizer + ?Sized> RegistrationAuthorizer for std::sync::Arc<T> {
  fn authorize<'a>(
    &'a self,
    worker_id: &'a WorkerId,
    request: &'a RequestHead,
  ) -> BoxFuture<'a, Result<TunnelClaims, AuthenticationError>> {
    T::authorize(self, worker_id, request)
  }
}
