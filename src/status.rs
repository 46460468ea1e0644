//! Per-server authentication readiness reporting
//!
//! The status surface answers one question per server: could the broker
//! produce credentials for it right now? Static schemes are checked
//! against their config fields; OAuth schemes are checked against the
//! bootstrap environment variables `CAPBROKER_<NAME>_TOKEN` and (for
//! user-interactive flows) `CAPBROKER_<NAME>_USER_ID`.
//!
//! Reports name which sources are present or absent but never echo a
//! secret value.

use colored::Colorize;
use serde::Serialize;

use crate::config::loader::ServerRegistry;
use crate::config::model::{AuthDescriptor, ServerDescriptor};

// ---------------------------------------------------------------------------
// Readiness model
// ---------------------------------------------------------------------------

/// Overall readiness of one server's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthReadiness {
    /// Every required credential source is present.
    Ready,
    /// Some sources are present, some missing.
    Partial,
    /// No required source is present.
    Missing,
}

impl AuthReadiness {
    /// Terminal symbol for the human-readable listing.
    fn symbol(&self) -> colored::ColoredString {
        match self {
            Self::Ready => "✓".green(),
            Self::Partial => "⚠".yellow(),
            Self::Missing => "✗".red(),
        }
    }
}

/// Readiness verdict plus the named credential sources behind it.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Overall verdict.
    pub status: AuthReadiness,
    /// Sources (config fields or environment variables) that are set.
    pub configured: Vec<String>,
    /// Sources that are required but absent.
    pub missing: Vec<String>,
}

/// Environment variable expected to carry a bootstrap access token for
/// an OAuth server.
pub fn bootstrap_token_var(server_name: &str) -> String {
    format!(
        "CAPBROKER_{}_TOKEN",
        server_name.to_uppercase().replace('-', "_")
    )
}

/// Environment variable expected to carry the bootstrap user identity
/// for a user-interactive OAuth server.
pub fn bootstrap_user_var(server_name: &str) -> String {
    format!(
        "CAPBROKER_{}_USER_ID",
        server_name.to_uppercase().replace('-', "_")
    )
}

/// Computes the readiness report for one server.
pub fn check_auth_status(descriptor: &ServerDescriptor) -> StatusReport {
    match descriptor.auth() {
        AuthDescriptor::None => StatusReport {
            status: AuthReadiness::Ready,
            configured: vec![],
            missing: vec![],
        },
        AuthDescriptor::Bearer { token } => {
            if token.is_some() {
                StatusReport {
                    status: AuthReadiness::Ready,
                    configured: vec!["bearer token (config)".to_string()],
                    missing: vec![],
                }
            } else {
                StatusReport {
                    status: AuthReadiness::Missing,
                    configured: vec![],
                    missing: vec!["Bearer token not configured in config file".to_string()],
                }
            }
        }
        AuthDescriptor::ApiKey { api_key, .. } => {
            if api_key.is_some() {
                StatusReport {
                    status: AuthReadiness::Ready,
                    configured: vec!["api key (config)".to_string()],
                    missing: vec![],
                }
            } else {
                StatusReport {
                    status: AuthReadiness::Missing,
                    configured: vec![],
                    missing: vec!["API key not configured in config file".to_string()],
                }
            }
        }
        AuthDescriptor::ClientCredentials(config) | AuthDescriptor::AuthorizationCode(config) => {
            let token_var = bootstrap_token_var(&descriptor.name);
            let user_var = bootstrap_user_var(&descriptor.name);

            let mut configured = Vec::new();
            let mut missing = Vec::new();

            if std::env::var(&token_var).is_ok() {
                configured.push(token_var);
            } else {
                missing.push(token_var);
            }

            if config.requires_user_auth {
                if std::env::var(&user_var).is_ok() {
                    configured.push(user_var);
                } else {
                    missing.push(user_var);
                }
            }

            let status = if missing.is_empty() {
                AuthReadiness::Ready
            } else if configured.is_empty() {
                AuthReadiness::Missing
            } else {
                AuthReadiness::Partial
            };

            StatusReport {
                status,
                configured,
                missing,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Prints the status block for one server.
pub fn print_server_status(descriptor: &ServerDescriptor, verbose: bool) -> StatusReport {
    let report = check_auth_status(descriptor);

    println!("{} {}", report.status.symbol(), descriptor.name.bold());
    println!("  Transport: {}", descriptor.transport);

    let auth = descriptor.auth();
    match &auth {
        AuthDescriptor::None => println!("  Auth: none"),
        other => {
            let mut line = other.type_name().to_string();
            if other
                .oauth_config()
                .map(|c| c.requires_user_auth)
                .unwrap_or(false)
            {
                line.push_str(" (requires user authentication)");
            }
            println!("  Auth: {line}");
        }
    }

    if verbose {
        if let Some(command) = &descriptor.command {
            println!("  Command: {command}");
        }
        if let Some(url) = &descriptor.url {
            println!("  URL: {url}");
        }
        if let Some(description) = &descriptor.description {
            println!("  Description: {description}");
        }
        for source in &report.configured {
            println!("  {} {}", "configured:".green(), source);
        }
    }

    for source in &report.missing {
        println!("  {} {}", "missing:".red(), source);
    }

    report
}

/// Prints the full catalog status and returns `true` when every server
/// is ready. The caller turns that into the process exit code.
pub fn print_status(registry: &ServerRegistry, verbose: bool) -> bool {
    let names = registry.list_servers();
    if names.is_empty() {
        println!("No capability servers configured.");
        return true;
    }

    let mut ready = 0usize;
    let mut total = 0usize;

    for name in &names {
        let Some(descriptor) = registry.get(name) else {
            continue;
        };
        total += 1;
        let report = print_server_status(&descriptor, verbose);
        if report.status == AuthReadiness::Ready {
            ready += 1;
        }
        println!();
    }

    println!("{ready}/{total} servers ready");
    ready == total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
