//! Error types for capbroker
//!
//! This module defines all error types used throughout the broker,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for capbroker operations
///
/// This enum encompasses all possible errors that can occur during
/// configuration loading, OAuth discovery and registration, token
/// acquisition, and connection management.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Configuration document could not be parsed or validated
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// Environment variable interpolation failed
    #[error("Environment variable {variable} not found and no default provided")]
    Interpolation {
        /// Name of the missing environment variable
        variable: String,
    },

    /// OAuth endpoint discovery failed when a caller explicitly required it
    #[error("OAuth discovery error: {0}")]
    Discovery(String),

    /// Dynamic client registration failed for one server
    #[error("Client registration error: {0}")]
    Registration(String),

    /// A token could not be acquired or refreshed
    #[error("Token acquisition error: {0}")]
    TokenAcquisition(String),

    /// The caller must send the user through an interactive
    /// authorization flow; retrying without one will not succeed
    #[error("Interactive authorization required: {0}")]
    AuthRequired(String),

    /// Transport-level connection failure (spawn, POST, stream)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A named server is not present in the registry
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for capbroker operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
