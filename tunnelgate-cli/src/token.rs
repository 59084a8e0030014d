// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use std::time::{Duration, SystemTime};
use tunnelgate::common::{
  authentication::{sign_token, token::MAX_TOKEN_LIFETIME, TunnelClaims},
  protocol::tunnel::WorkerId,
};

pub struct TokenArgs {
  pub id: WorkerId,
  pub secret: String,
  pub audience: Option<String>,
  pub lifetime: Duration,
}

pub fn token_main(args: TokenArgs) -> Result<()> {
  if args.lifetime > MAX_TOKEN_LIFETIME {
    anyhow::bail!(
      "Lifetime of {:?} exceeds the {:?} relays accept",
      args.lifetime,
      MAX_TOKEN_LIFETIME
    );
  }
  let mut claims = TunnelClaims::new(args.id.raw(), SystemTime::now(), args.lifetime);
  if let Some(audience) = args.audience {
    claims = claims.with_audience(audience);
  }
  let token = sign_token(&claims, args.secret.as_bytes())?;
  println!("{token}");
  Ok(())
}
