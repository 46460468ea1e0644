//! Typed descriptors for capability servers and their authentication
//!
//! The configuration document is parsed into [`ServerDescriptor`] values,
//! each carrying an [`AuthDescriptor`] -- a sealed tagged union with one
//! variant per supported authentication scheme. Call sites dispatch on the
//! variant once (via `match` or [`AuthDescriptor::static_headers`]) instead
//! of re-checking a type tag ad hoc.
//!
//! Descriptors are immutable after load with a single exception: dynamic
//! client registration writes the obtained `client_id`/`client_secret`
//! into the descriptor. That mutation goes through an interior `RwLock`
//! with short critical sections, so it is safe to repeat and never
//! corrupts concurrent readers.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Transport used to reach a capability server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local subprocess speaking over stdin/stdout pipes.
    Stdio,
    /// Request-scoped HTTP endpoint.
    Http,
    /// Persistent server-sent-events stream.
    Sse,
}

impl TransportKind {
    /// Parses a transport string from the configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfigParse`] for unknown transport names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => {
                Err(BrokerError::ConfigParse(format!("unknown transport type: {other}")).into())
            }
        }
    }

    /// Returns the configuration spelling of this transport.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Re-registration policy
// ---------------------------------------------------------------------------

/// Policy applied when an authentication attempt starts and the server
/// already holds dynamically registered client credentials.
///
/// `Always` clears and re-registers the client on every attempt, which
/// picks up redirect-URI changes at the cost of an extra round trip per
/// authentication. `Reuse` keeps the existing registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReregistrationPolicy {
    /// Keep an existing dynamic registration (default).
    #[default]
    Reuse,
    /// Discard and re-register on every authentication attempt.
    Always,
}

// ---------------------------------------------------------------------------
// OAuthConfig
// ---------------------------------------------------------------------------

/// Endpoint and credential configuration shared by both OAuth2 flows.
///
/// All endpoint fields are optional: whatever is not configured manually
/// may be filled by RFC 8414 discovery, and client credentials may be
/// obtained via RFC 7591 dynamic registration. Manually configured
/// endpoints always take precedence over discovered ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// OAuth client identifier, if provisioned ahead of time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// OAuth client secret, if provisioned ahead of time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Space-separated scope string requested from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Manually configured token endpoint. Wins over discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// Manually configured authorization endpoint. Wins over discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,

    /// Redirect URI for the authorization-code callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    /// RFC 7591 dynamic client registration endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_registration_url: Option<String>,

    /// Base URL for RFC 8414 discovery. When absent, the scheme and
    /// authority of the server URL are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_url: Option<String>,

    /// Whether endpoint discovery may be attempted at all.
    #[serde(default = "default_enable_discovery")]
    pub enable_discovery: bool,

    /// Timeout in seconds for discovery requests.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: u64,

    /// True when the flow needs an interactive user (authorization code).
    #[serde(default)]
    pub requires_user_auth: bool,

    /// What to do with an existing dynamic registration on a new
    /// authentication attempt.
    #[serde(default)]
    pub reregister: ReregistrationPolicy,

    /// Set when `client_id`/`client_secret` came from dynamic
    /// registration. Session-scoped credentials are never written back
    /// to the configuration document.
    #[serde(skip)]
    pub ephemeral_credentials: bool,
}

fn default_enable_discovery() -> bool {
    true
}

fn default_discovery_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// AuthDescriptor
// ---------------------------------------------------------------------------

/// Authentication scheme for one capability server.
///
/// Exactly one variant's fields are populated for a given server. The
/// static variants (`None`, `Bearer`, `ApiKey`) compute their headers
/// directly via [`static_headers`](Self::static_headers); the OAuth2
/// variants are driven exclusively through a
/// [`TokenManager`](crate::auth::token::TokenManager), which is never
/// constructed for a static variant.
#[derive(Debug, Clone)]
pub enum AuthDescriptor {
    /// No authentication.
    None,

    /// Static bearer token sent as `Authorization: Bearer <token>`.
    Bearer {
        /// The token value. Absence is reported by the status surface
        /// and rejected at connection time.
        token: Option<String>,
    },

    /// Static API key sent in a configurable header.
    ApiKey {
        /// The key value.
        api_key: Option<String>,
        /// Header carrying the key (defaults to `Authorization`).
        header_name: String,
    },

    /// OAuth2 client-credentials flow (machine-to-machine).
    ClientCredentials(OAuthConfig),

    /// OAuth2 authorization-code flow (user-interactive, PKCE-capable).
    AuthorizationCode(OAuthConfig),
}

impl AuthDescriptor {
    /// Parses an `auth` block from the (already interpolated)
    /// configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfigParse`] when the `type` field is
    /// missing, unknown, or the block is malformed.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let auth_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| BrokerError::ConfigParse("auth block is missing `type`".to_string()))?;

        let str_field =
            |name: &str| -> Option<String> { value.get(name)?.as_str().map(str::to_string) };

        match auth_type {
            "none" => Ok(Self::None),
            "bearer" => Ok(Self::Bearer {
                token: str_field("token"),
            }),
            "api_key" => Ok(Self::ApiKey {
                api_key: str_field("api_key"),
                header_name: str_field("header_name")
                    .unwrap_or_else(|| "Authorization".to_string()),
            }),
            "oauth2_client_credentials" => {
                let config: OAuthConfig = serde_json::from_value(value.clone())
                    .map_err(|e| BrokerError::ConfigParse(format!("invalid oauth block: {e}")))?;
                Ok(Self::ClientCredentials(config))
            }
            "oauth2_authorization_code" => {
                let config: OAuthConfig = serde_json::from_value(value.clone())
                    .map_err(|e| BrokerError::ConfigParse(format!("invalid oauth block: {e}")))?;
                Ok(Self::AuthorizationCode(config))
            }
            other => Err(BrokerError::ConfigParse(format!("unknown auth type: {other}")).into()),
        }
    }

    /// Returns the configuration spelling of this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer { .. } => "bearer",
            Self::ApiKey { .. } => "api_key",
            Self::ClientCredentials(_) => "oauth2_client_credentials",
            Self::AuthorizationCode(_) => "oauth2_authorization_code",
        }
    }

    /// True for the OAuth2 variants, which require a token manager.
    pub fn is_oauth(&self) -> bool {
        matches!(
            self,
            Self::ClientCredentials(_) | Self::AuthorizationCode(_)
        )
    }

    /// Returns the shared OAuth configuration for the OAuth2 variants.
    pub fn oauth_config(&self) -> Option<&OAuthConfig> {
        match self {
            Self::ClientCredentials(c) | Self::AuthorizationCode(c) => Some(c),
            _ => None,
        }
    }

    /// Computes the request headers for the static variants.
    ///
    /// Returns `Ok(None)` for the OAuth2 variants, whose headers must
    /// come from a token manager instead.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TokenAcquisition`] when a bearer token or
    /// API key is required but not configured.
    pub fn static_headers(&self) -> Result<Option<HashMap<String, String>>> {
        match self {
            Self::None => Ok(Some(HashMap::new())),
            Self::Bearer { token } => {
                let token = token.as_deref().ok_or_else(|| {
                    BrokerError::TokenAcquisition("bearer token not configured".to_string())
                })?;
                let mut headers = HashMap::new();
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(Some(headers))
            }
            Self::ApiKey {
                api_key,
                header_name,
            } => {
                let key = api_key.as_deref().ok_or_else(|| {
                    BrokerError::TokenAcquisition("api key not configured".to_string())
                })?;
                let mut headers = HashMap::new();
                headers.insert(header_name.clone(), key.to_string());
                Ok(Some(headers))
            }
            Self::ClientCredentials(_) | Self::AuthorizationCode(_) => Ok(None),
        }
    }

    /// Serializes this descriptor back into an `auth` block.
    ///
    /// Session-scoped client credentials (those obtained via dynamic
    /// registration) are filtered out so that a re-serialized document
    /// never contains them. Returns `None` for [`AuthDescriptor::None`],
    /// matching documents that simply omit the block.
    pub fn to_value(&self) -> Option<serde_json::Value> {
        match self {
            Self::None => None,
            Self::Bearer { token } => {
                let mut block = serde_json::json!({ "type": "bearer" });
                if let Some(token) = token {
                    block["token"] = serde_json::Value::String(token.clone());
                }
                Some(block)
            }
            Self::ApiKey {
                api_key,
                header_name,
            } => {
                let mut block = serde_json::json!({
                    "type": "api_key",
                    "header_name": header_name,
                });
                if let Some(key) = api_key {
                    block["api_key"] = serde_json::Value::String(key.clone());
                }
                Some(block)
            }
            Self::ClientCredentials(config) | Self::AuthorizationCode(config) => {
                let mut sanitized = config.clone();
                if sanitized.ephemeral_credentials {
                    sanitized.client_id = None;
                    sanitized.client_secret = None;
                }
                let mut block =
                    serde_json::to_value(&sanitized).expect("oauth config serializes to json");
                block["type"] = serde_json::Value::String(self.type_name().to_string());
                Some(block)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ServerDescriptor
// ---------------------------------------------------------------------------

/// One capability server from the catalog.
///
/// Launch/endpoint fields are fixed at load time. The `auth` descriptor
/// sits behind a `RwLock` because dynamic client registration (and
/// post-load discovery) must be able to update it while connections are
/// reading it concurrently. Lock sections are short and never held
/// across an await point.
#[derive(Debug)]
pub struct ServerDescriptor {
    /// Unique server name; the registry key.
    pub name: String,

    /// Transport used to reach this server.
    pub transport: TransportKind,

    /// Executable to spawn (stdio transport).
    pub command: Option<String>,

    /// Arguments passed to the executable (stdio transport).
    pub args: Vec<String>,

    /// Environment overrides merged over the parent process environment
    /// when spawning (stdio transport).
    pub env: HashMap<String, String>,

    /// Endpoint URL (http/sse transports).
    pub url: Option<String>,

    /// Per-request / connect timeout in seconds.
    pub timeout: u64,

    /// Human-readable description from the catalog.
    pub description: Option<String>,

    auth: RwLock<AuthDescriptor>,
}

impl ServerDescriptor {
    /// Builds a descriptor with the given auth scheme.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        transport: TransportKind,
        command: Option<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        url: Option<String>,
        timeout: u64,
        description: Option<String>,
        auth: AuthDescriptor,
    ) -> Self {
        Self {
            name,
            transport,
            command,
            args,
            env,
            url,
            timeout,
            description,
            auth: RwLock::new(auth),
        }
    }

    /// Returns a snapshot of the current auth descriptor.
    ///
    /// Cloning keeps the read lock section short; callers work on the
    /// snapshot and never observe a half-written update.
    pub fn auth(&self) -> AuthDescriptor {
        self.auth.read().expect("auth lock poisoned").clone()
    }

    /// Replaces the auth descriptor. Used by post-load discovery when a
    /// server without an `auth` block turns out to advertise OAuth.
    pub fn set_auth(&self, auth: AuthDescriptor) {
        *self.auth.write().expect("auth lock poisoned") = auth;
    }

    /// Writes dynamically registered client credentials into the OAuth
    /// configuration, tagging them session-scoped.
    ///
    /// Safe to repeat: a second registration simply overwrites the
    /// first. A no-op for non-OAuth descriptors.
    pub fn store_registered_client(&self, client_id: String, client_secret: Option<String>) {
        let mut guard = self.auth.write().expect("auth lock poisoned");
        if let AuthDescriptor::ClientCredentials(config)
        | AuthDescriptor::AuthorizationCode(config) = &mut *guard
        {
            config.client_id = Some(client_id);
            config.client_secret = client_secret;
            config.ephemeral_credentials = true;
        }
    }

    /// Clears dynamically registered client credentials so that the next
    /// authentication attempt registers afresh.
    ///
    /// Statically configured credentials are left untouched.
    pub fn clear_registered_client(&self) {
        let mut guard = self.auth.write().expect("auth lock poisoned");
        if let AuthDescriptor::ClientCredentials(config)
        | AuthDescriptor::AuthorizationCode(config) = &mut *guard
        {
            if config.ephemeral_credentials {
                config.client_id = None;
                config.client_secret = None;
                config.ephemeral_credentials = false;
            }
        }
    }

    /// Scheme and authority of the server URL, used as the discovery
    /// base when no `discovery_url` is configured.
    pub fn base_url(&self) -> Option<String> {
        let url = url::Url::parse(self.url.as_deref()?).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
