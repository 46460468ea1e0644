//! capbroker - connection broker library for capability servers
//!
//! This library brokers authenticated connections to pluggable external
//! capability servers reachable over three transports: local subprocess
//! (stdio), request-scoped HTTP, and persistent SSE streaming. Its job
//! is credential lifecycle management -- resolving which authentication
//! scheme each server needs, acquiring and refreshing OAuth2 tokens per
//! flow, discovering OAuth endpoints when not manually configured, and
//! registering an OAuth client dynamically when no credentials exist --
//! kept correct for many concurrent users against many servers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `config`: catalog parsing, env interpolation, typed descriptors
//! - `auth`: discovery, registration, PKCE, token managers, sessions
//! - `connection`: transport sessions and the connection manager
//! - `status`: per-server credential readiness reporting
//! - `broker`: the explicit top-level context object
//! - `error`: error types and result alias
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use capbroker::broker::Broker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Broker::open(Path::new("capbroker.json")).await?;
//!     let connected = broker
//!         .connections
//!         .connect_group("research", Some("alice"))
//!         .await;
//!     println!("connected: {connected:?}");
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod status;

// Re-export commonly used types
pub use broker::Broker;
pub use config::{AuthDescriptor, ServerDescriptor, ServerRegistry, TransportKind};
pub use error::{BrokerError, Result};
