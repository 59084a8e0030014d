// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting authorization of worker registrations
#[deny(unused_imports)]
mod traits;
pub use traits::*;

mod bearer;
pub use bearer::BearerTokenAuthorizer;

pub mod token;
pub use token::{sign_token, TokenValidator, TunnelClaims};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
  #[error("No bearer token was presented")]
  MissingToken,
  #[error("Token is not a well-formed HS256 JWT")]
  MalformedToken,
  #[error("Token algorithm {0:?} is not accepted")]
  UnsupportedAlgorithm(String),
  #[error("Token signature matched no active secret")]
  SignatureMismatch,
  #[error("Token is not valid yet")]
  NotYetValid,
  #[error("Token has expired")]
  Expired,
  #[error("Token lifetime exceeds the allowed maximum")]
  LifetimeTooLong,
  #[error("Token audience does not include this relay")]
  AudienceMismatch,
  #[error("Token was issued for another worker")]
  SubjectMismatch,
  #[error("Signing secret cannot be used as an HMAC key")]
  InvalidSecret,
}
