// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use super::{AuthenticationError, RegistrationAuthorizer, TokenValidator, TunnelClaims};
use crate::common::protocol::{http::RequestHead, tunnel::WorkerId};

/// Authorizes registrations carrying an `Authorization: Bearer` tunnel token
/// issued for the worker ID being registered
#[derive(Debug, Clone)]
pub struct BearerTokenAuthorizer {
  validator: TokenValidator,
}

impl BearerTokenAuthorizer {
  pub fn new(validator: TokenValidator) -> Self {
    Self { validator }
  }
}

impl RegistrationAuthorizer for BearerTokenAuthorizer {
  fn authorize<'a>(
    &'a self,
    worker_id: &'a WorkerId,
    request: &'a RequestHead,
  ) -> BoxFuture<'a, Result<TunnelClaims, AuthenticationError>> {
    let result = request
      .bearer_token()
      .ok_or(AuthenticationError::MissingToken)
      .and_then(|token| self.validator.validate(token))
      .and_then(|claims| match claims.subject() {
        Some(subject) if subject == worker_id.raw() => Ok(claims),
        _ => Err(AuthenticationError::SubjectMismatch),
      });
    if let Err(e) = &result {
      tracing::debug!(worker_id = %worker_id, error = %e, "Registration token rejected");
    }
    futures::future::ready(result).boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::time::{Duration, SystemTime};

  use super::BearerTokenAuthorizer;
  use crate::common::{
    authentication::{
      sign_token, AuthenticationError, RegistrationAuthorizer, TokenValidator, TunnelClaims,
    },
    protocol::{http::RequestHead, tunnel::WorkerId},
  };

  fn request(authorization: Option<String>) -> RequestHead {
    let mut head = RequestHead {
      method: "GET".into(),
      target: "/register/W1".into(),
      version: 1,
      headers: vec![],
    };
    if let Some(value) = authorization {
      head.set_header("authorization", value);
    }
    head
  }

  #[tokio::test]
  async fn token_must_name_the_registering_worker() {
    let authorizer = BearerTokenAuthorizer::new(TokenValidator::new("a", "b"));
    let token = sign_token(
      &TunnelClaims::new("W1", SystemTime::now(), Duration::from_secs(600)),
      b"a",
    )
    .unwrap();
    let head = request(Some(format!("Bearer {token}")));

    let w1 = WorkerId::parse("W1").unwrap();
    let w2 = WorkerId::parse("W2").unwrap();
    assert!(authorizer.authorize(&w1, &head).await.is_ok());
    assert_eq!(
      authorizer.authorize(&w2, &head).await.unwrap_err(),
      AuthenticationError::SubjectMismatch
    );
    assert_eq!(
      authorizer.authorize(&w1, &request(None)).await.unwrap_err(),
      AuthenticationError::MissingToken
    );
  }
}
