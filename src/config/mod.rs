//! Server catalog configuration
//!
//! This module owns the declarative configuration model: parsing the
//! server catalog document, interpolating environment variables, and
//! the typed descriptors the rest of the broker works with.
//!
//! # Module Layout
//!
//! - `interpolate` -- `${VAR}` / `${VAR|default}` / `${VAR|null}` expansion
//! - `model`       -- `ServerDescriptor`, `AuthDescriptor`, transport kinds
//! - `loader`      -- two-shape document parsing into a `ServerRegistry`

pub mod interpolate;
pub mod loader;
pub mod model;

pub use loader::ServerRegistry;
pub use model::{AuthDescriptor, OAuthConfig, ReregistrationPolicy, ServerDescriptor, TransportKind};
