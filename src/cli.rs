//! Command-line interface definition for capbroker
//!
//! This module defines the CLI structure using clap's derive API,
//! providing the status/diagnostic surface over the server catalog.

use clap::{Parser, Subcommand};

/// capbroker - connection broker for authenticated capability servers
///
/// Inspect the server catalog and report whether the broker could
/// produce credentials for each configured server.
#[derive(Parser, Debug, Clone)]
#[command(name = "capbroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the server catalog file
    #[arg(short, long, default_value = "capbroker.json")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for capbroker
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Report per-server authentication readiness
    ///
    /// Exits 0 when every configured server is ready, non-zero
    /// otherwise.
    Status {
        /// Show transport details and configured credential sources
        #[arg(short, long)]
        detailed: bool,
    },

    /// List configured server names
    Servers,

    /// List configured server groups and their members
    Groups,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
