//! RFC 8414 OAuth authorization server discovery
//!
//! Resolves authorization/token/registration endpoints from the
//! well-known metadata document instead of manual configuration:
//!
//! ```text
//! GET {base}/.well-known/oauth-authorization-server
//! ```
//!
//! Results are cached per server for the process lifetime. Manual
//! configuration always takes precedence over discovered endpoints;
//! that precedence is enforced by the callers
//! ([`TokenManager`](crate::auth::token::TokenManager) and the config
//! loader), which only consult discovery for fields they do not already
//! have.
//!
//! Discovery failure is an ordinary branch, not an exception:
//! [`DiscoveryClient::try_discover`] returns `Option` for the automatic
//! path (a server that does not advertise OAuth is simply treated as
//! unauthenticated), while [`DiscoveryClient::discover`] returns an
//! error for callers that explicitly require metadata and have no
//! manual fallback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Well-known path suffix defined by RFC 8414.
const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

// ---------------------------------------------------------------------------
// AuthServerMetadata
// ---------------------------------------------------------------------------

/// Subset of the RFC 8414 authorization server metadata document that
/// the broker consumes.
///
/// A document without a `token_endpoint` is rejected; all other fields
/// are optional. Unmodelled fields are preserved in `extra`.
///
/// # Examples
///
/// ```
/// use capbroker::auth::discovery::AuthServerMetadata;
///
/// let json = r#"{
///     "issuer": "https://auth.example.com",
///     "token_endpoint": "https://auth.example.com/token",
///     "authorization_endpoint": "https://auth.example.com/authorize"
/// }"#;
///
/// let meta: AuthServerMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.token_endpoint, "https://auth.example.com/token");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    /// The issuer identifier URI, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// The URL of the token endpoint (RFC 6749 section 3.2). Required.
    pub token_endpoint: String,

    /// The URL of the authorization endpoint (RFC 6749 section 3.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// Optional RFC 7591 dynamic client registration endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// OAuth scopes the server supports, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// PKCE challenge methods the server supports (e.g. `["S256"]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Additional server metadata fields not explicitly modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Builds the RFC 8414 well-known URL for a discovery base.
///
/// Trailing slashes on `base` are stripped so that
/// `https://host/` and `https://host` produce the same URL.
///
/// # Examples
///
/// ```
/// use capbroker::auth::discovery::well_known_url;
///
/// assert_eq!(
///     well_known_url("https://auth.example.com/"),
///     "https://auth.example.com/.well-known/oauth-authorization-server",
/// );
/// ```
pub fn well_known_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), WELL_KNOWN_PATH)
}

// ---------------------------------------------------------------------------
// DiscoveryClient
// ---------------------------------------------------------------------------

/// Fetches and caches authorization server metadata per capability
/// server.
///
/// The cache key is the server name, so two servers sharing one
/// authorization host still resolve independently (they may configure
/// different discovery bases).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use capbroker::auth::discovery::DiscoveryClient;
///
/// # async fn example() -> capbroker::error::Result<()> {
/// let client = DiscoveryClient::new(Arc::new(reqwest::Client::new()));
/// let meta = client
///     .discover("tools", "https://api.example.com", Duration::from_secs(10))
///     .await?;
/// println!("token endpoint: {}", meta.token_endpoint);
/// # Ok(())
/// # }
/// ```
pub struct DiscoveryClient {
    http: Arc<reqwest::Client>,
    cache: Mutex<HashMap<String, AuthServerMetadata>>,
}

impl DiscoveryClient {
    /// Creates a discovery client with an empty cache.
    pub fn new(http: Arc<reqwest::Client>) -> Self {
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached metadata for a server, if discovery has
    /// already succeeded for it.
    pub fn cached(&self, server_name: &str) -> Option<AuthServerMetadata> {
        self.cache
            .lock()
            .expect("discovery cache lock poisoned")
            .get(server_name)
            .cloned()
    }

    /// Fetches the well-known metadata document for a server.
    ///
    /// Returns the cached document when one exists. On a cache miss the
    /// document is fetched with the given timeout, validated, cached,
    /// and returned.
    ///
    /// This is the entry point for callers that *require* metadata
    /// (e.g. resolving a token endpoint with no manual fallback). For
    /// the automatic best-effort path use
    /// [`try_discover`](Self::try_discover).
    ///
    /// # Arguments
    ///
    /// * `server_name` - Registry key of the server; the cache key.
    /// * `base_url` - Discovery base (scheme + authority, optionally a
    ///   path prefix).
    /// * `timeout` - Bound on the whole discovery request.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Discovery`] when the request fails, times
    /// out, returns a non-success status, or the document lacks a
    /// `token_endpoint`.
    pub async fn discover(
        &self,
        server_name: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<AuthServerMetadata> {
        if let Some(cached) = self.cached(server_name) {
            return Ok(cached);
        }

        let url = well_known_url(base_url);
        tracing::debug!(server = server_name, url = %url, "fetching OAuth metadata");

        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BrokerError::Discovery(format!("metadata fetch failed for {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(BrokerError::Discovery(format!(
                "metadata endpoint returned {} for {}",
                response.status(),
                url
            ))
            .into());
        }

        let document: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BrokerError::Discovery(format!("invalid metadata document: {e}")))?;

        if document.get("token_endpoint").and_then(|v| v.as_str()).is_none() {
            return Err(BrokerError::Discovery(format!(
                "metadata from {url} is missing required token_endpoint"
            ))
            .into());
        }

        let metadata: AuthServerMetadata = serde_json::from_value(document)
            .map_err(|e| BrokerError::Discovery(format!("invalid metadata document: {e}")))?;

        self.cache
            .lock()
            .expect("discovery cache lock poisoned")
            .insert(server_name.to_string(), metadata.clone());

        Ok(metadata)
    }

    /// Best-effort discovery for the automatic configuration path.
    ///
    /// Any failure (network error, timeout, missing `token_endpoint`)
    /// is logged at DEBUG and collapsed to `None`: the server is then
    /// treated as unauthenticated rather than broken.
    pub async fn try_discover(
        &self,
        server_name: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Option<AuthServerMetadata> {
        match self.discover(server_name, base_url, timeout).await {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::debug!(
                    server = server_name,
                    error = %e,
                    "OAuth discovery failed; treating server as unauthenticated"
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
