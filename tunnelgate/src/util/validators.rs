// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::common::protocol::tunnel::WorkerId;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_port(v: &str) -> Result<u16> {
  match v.parse::<u16>() {
    Ok(0) => Err(AnyErr::msg("Port 0 cannot be dialed")),
    Ok(port) => Ok(port),
    Err(_) => Err(AnyErr::msg("Port was not a valid u16")),
  }
}

/// Accepts `http://` and `https://` base URLs without query or fragment
pub fn parse_relay_url(v: &str) -> Result<String> {
  let rest = v
    .strip_prefix("http://")
    .or_else(|| v.strip_prefix("https://"))
    .ok_or_else(|| AnyErr::msg("Relay URL must start with http:// or https://"))?;
  let authority = rest.split('/').next().unwrap_or_default();
  if authority.is_empty() {
    return Err(AnyErr::msg("Relay URL must name a host"));
  }
  if rest.contains(['?', '#']) {
    return Err(AnyErr::msg("Relay URL must not carry a query or fragment"));
  }
  Ok(v.trim_end_matches('/').to_string())
}

pub fn parse_seconds(v: &str) -> Result<std::time::Duration> {
  v.parse::<u64>()
    .map(std::time::Duration::from_secs)
    .map_err(|_| AnyErr::msg("Expected a whole number of seconds"))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_relay_url(v: &str) -> Result<(), String> {
  parse_relay_url(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_worker_id(v: &str) -> Result<(), String> {
  WorkerId::parse(v).map(|_| ()).map_err(|e| e.to_string())
}
