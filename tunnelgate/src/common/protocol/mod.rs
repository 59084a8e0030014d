// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire-level pieces shared by the relay and the worker
//!
//! - [http]: reading request heads off raw connections the relay takes over
//! - [mux]: logical streams over one upgraded connection
//! - [tunnel]: the transport traits, worker identity, and the session registry
//! - [proxy_tcp]: handing accepted streams to a local service

pub mod http;
pub mod mux;
pub mod proxy_tcp;
pub mod tunnel;
