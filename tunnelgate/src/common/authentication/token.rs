// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! HS256 JSON Web Tokens authorizing a worker to register under its ID

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::AuthenticationError;

type HmacSha256 = Hmac<Sha256>;

/// Tokens may not be valid for longer than this, regardless of their claims
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(31 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
  Single(String),
  Many(Vec<String>),
}

impl Audience {
  pub fn contains(&self, audience: &str) -> bool {
    match self {
      Audience::Single(single) => single == audience,
      Audience::Many(many) => many.iter().any(|a| a == audience),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClaims {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sub: Option<String>,
  /// Older issuers name the worker in `tid` rather than `sub`
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tid: Option<String>,
  pub nbf: i64,
  pub exp: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub aud: Option<Audience>,
}

impl TunnelClaims {
  pub fn new(worker_id: impl Into<String>, not_before: SystemTime, lifetime: Duration) -> Self {
    let nbf = unix_seconds(not_before);
    Self {
      sub: Some(worker_id.into()),
      tid: None,
      nbf,
      exp: nbf.saturating_add(lifetime.as_secs() as i64),
      aud: None,
    }
  }

  pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
    self.aud = Some(Audience::Single(audience.into()));
    self
  }

  /// The worker ID these claims were issued for
  pub fn subject(&self) -> Option<&str> {
    self.sub.as_deref().or(self.tid.as_deref())
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
  alg: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  typ: Option<String>,
}

fn unix_seconds(time: SystemTime) -> i64 {
  match time.duration_since(UNIX_EPOCH) {
    Ok(since) => since.as_secs() as i64,
    Err(before) => -(before.duration().as_secs() as i64),
  }
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256, AuthenticationError> {
  HmacSha256::new_from_slice(secret).map_err(|_| AuthenticationError::InvalidSecret)
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, AuthenticationError> {
  let json = serde_json::to_vec(value).map_err(|_| AuthenticationError::MalformedToken)?;
  Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Signs `claims` with `secret`; issuance normally belongs to a credential service
pub fn sign_token(claims: &TunnelClaims, secret: &[u8]) -> Result<String, AuthenticationError> {
  let header = Header {
    alg: "HS256".into(),
    typ: Some("JWT".into()),
  };
  let signing_input = format!("{}.{}", encode_json(&header)?, encode_json(claims)?);
  let mut mac = mac_for(secret)?;
  mac.update(signing_input.as_bytes());
  let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
  Ok(format!("{signing_input}.{signature}"))
}

/// Validates tunnel tokens against the relay's active secrets
///
/// Two secrets are active at once so one can be rotated out while tokens
/// signed with the other remain valid.
#[derive(Clone)]
pub struct TokenValidator {
  secrets: Vec<Vec<u8>>,
  audience: Option<String>,
}

impl TokenValidator {
  pub fn new(secret_a: impl Into<Vec<u8>>, secret_b: impl Into<Vec<u8>>) -> Self {
    Self {
      secrets: vec![secret_a.into(), secret_b.into()],
      audience: None,
    }
  }

  pub fn with_audience(mut self, audience: Option<String>) -> Self {
    self.audience = audience;
    self
  }

  pub fn validate(&self, token: &str) -> Result<TunnelClaims, AuthenticationError> {
    self.validate_at(token, SystemTime::now())
  }

  pub fn validate_at(
    &self,
    token: &str,
    now: SystemTime,
  ) -> Result<TunnelClaims, AuthenticationError> {
    let mut parts = token.split('.');
    let segments = (parts.next(), parts.next(), parts.next(), parts.next());
    let (header, claims, signature) = match segments {
      (Some(header), Some(claims), Some(signature), None) => (header, claims, signature),
      _ => return Err(AuthenticationError::MalformedToken),
    };
    let signing_input = &token[..header.len() + 1 + claims.len()];

    let header: Header = decode_json(header)?;
    if header.alg != "HS256" {
      return Err(AuthenticationError::UnsupportedAlgorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
      .decode(signature)
      .map_err(|_| AuthenticationError::MalformedToken)?;
    self.verify_signature(signing_input.as_bytes(), &signature)?;

    let claims: TunnelClaims = decode_json(claims)?;
    let now = unix_seconds(now);
    if now < claims.nbf {
      return Err(AuthenticationError::NotYetValid);
    }
    if now > claims.exp {
      return Err(AuthenticationError::Expired);
    }
    if claims.exp.saturating_sub(claims.nbf) > MAX_TOKEN_LIFETIME.as_secs() as i64 {
      return Err(AuthenticationError::LifetimeTooLong);
    }
    if let (Some(expected), Some(audience)) = (&self.audience, &claims.aud) {
      if !audience.contains(expected) {
        return Err(AuthenticationError::AudienceMismatch);
      }
    }
    Ok(claims)
  }

  fn verify_signature(
    &self,
    signing_input: &[u8],
    signature: &[u8],
  ) -> Result<(), AuthenticationError> {
    for (index, secret) in self.secrets.iter().enumerate() {
      let mut mac = mac_for(secret)?;
      mac.update(signing_input);
      match mac.verify_slice(signature) {
        Ok(()) => return Ok(()),
        Err(_) => tracing::debug!(secret_index = index, "Token signature did not match secret"),
      }
    }
    Err(AuthenticationError::SignatureMismatch)
  }
}

impl std::fmt::Debug for TokenValidator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TokenValidator")
      .field("secrets", &self.secrets.len())
      .field("audience", &self.audience)
      .finish()
  }
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthenticationError> {
  let raw = URL_SAFE_NO_PAD
    .decode(segment)
    .map_err(|_| AuthenticationError::MalformedToken)?;
  serde_json::from_slice(&raw).map_err(|_| AuthenticationError::MalformedToken)
}
