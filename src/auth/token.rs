//! OAuth2 token lifecycle per (user, server) pair
//!
//! A [`TokenManager`] owns the flow-specific acquire/refresh/exchange
//! logic and the expiry bookkeeping for one user against one capability
//! server. Managers are created lazily by the
//! [`UserSessionStore`](crate::auth::session::UserSessionStore) and are
//! never constructed for static auth schemes (`none`/`bearer`/`api_key`).
//!
//! # Token state machine
//!
//! ```text
//! NoToken -> Valid -> Expired -> (Refreshing) -> Valid
//! ```
//!
//! The client-credentials flow refreshes unconditionally with its
//! client id/secret. The authorization-code flow refreshes via its
//! refresh token when one is held; without one the manager fails with
//! an error telling the caller to send the user back through the
//! interactive flow.
//!
//! Concurrent `get_token` calls for the same manager never trigger
//! duplicate refreshes: a refresh gate serializes them, and late
//! arrivals re-check the cache after acquiring the gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::discovery::DiscoveryClient;
use crate::auth::registration::effective_redirect_uri;
use crate::config::model::{AuthDescriptor, OAuthConfig, ServerDescriptor};
use crate::error::{BrokerError, Result};

/// Fixed safety margin subtracted from a token's lifetime so that
/// refresh happens before real expiry. A token whose `expires_in` is
/// at or below this margin is treated as already expired.
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

// ---------------------------------------------------------------------------
// OAuthToken
// ---------------------------------------------------------------------------

/// Client credentials that were obtained via dynamic registration and
/// therefore live only for this session.
#[derive(Debug, Clone)]
pub struct SessionClient {
    /// The dynamically registered client id.
    pub client_id: String,
    /// The dynamically registered client secret, when issued.
    pub client_secret: Option<String>,
}

/// An acquired OAuth2 access token with its bookkeeping.
///
/// `expires_at` is an absolute instant with the safety margin already
/// subtracted: a token is usable exactly while `Utc::now() < expires_at`.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use capbroker::auth::token::OAuthToken;
///
/// let token = OAuthToken {
///     access_token: "tok".to_string(),
///     refresh_token: None,
///     expires_at: Utc::now() + Duration::hours(1),
///     subject: None,
///     session_client: None,
/// };
/// assert!(!token.is_expired());
/// ```
#[derive(Debug, Clone)]
pub struct OAuthToken {
    /// The access token string issued by the authorization server.
    pub access_token: String,

    /// Refresh token for obtaining a new access token without a full
    /// re-authorization, when the server issued one.
    pub refresh_token: Option<String>,

    /// Absolute UTC instant past which the token must not be used.
    pub expires_at: DateTime<Utc>,

    /// Subject identifier extracted from the token-response claims
    /// (`user_id`/`userId`/`sub`/`id`/`username`), when present. Lets
    /// callers re-key a session under the token-provided identity.
    pub subject: Option<String>,

    /// Session-scoped client credentials, set when the token was
    /// obtained through a dynamically registered client. Never
    /// persisted to the configuration document.
    pub session_client: Option<SessionClient>,
}

impl OAuthToken {
    /// True once the (margin-adjusted) expiry instant has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Token endpoint response
// ---------------------------------------------------------------------------

/// Raw JSON response from an OAuth token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Everything else, scanned for a subject identifier claim.
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

impl TokenResponse {
    /// Converts the raw response into an [`OAuthToken`], applying the
    /// expiry safety margin and extracting the subject claim.
    fn into_token(self, session_client: Option<SessionClient>) -> OAuthToken {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = Utc::now()
            + chrono::Duration::seconds(
                i64::try_from(expires_in).unwrap_or(i64::MAX) - EXPIRY_MARGIN_SECS,
            );

        let subject = ["user_id", "userId", "sub", "id", "username"]
            .iter()
            .find_map(|key| match self.extra.get(*key) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                _ => None,
            });

        OAuthToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            subject,
            session_client,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenManager
// ---------------------------------------------------------------------------

/// Flow-specific token acquisition and refresh for one (user, server)
/// pair.
///
/// The manager snapshots the server's [`AuthDescriptor`] on every
/// operation, so endpoints filled in later by discovery and client
/// credentials written by dynamic registration are picked up without
/// recreating the manager.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use capbroker::auth::discovery::DiscoveryClient;
/// use capbroker::auth::token::TokenManager;
///
/// # async fn example(descriptor: Arc<capbroker::config::ServerDescriptor>) -> capbroker::error::Result<()> {
/// let http = Arc::new(reqwest::Client::new());
/// let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
/// let manager = TokenManager::new(descriptor, Some("alice".to_string()), http, discovery)?;
/// let access_token = manager.get_token().await?;
/// # Ok(())
/// # }
/// ```
pub struct TokenManager {
    descriptor: Arc<ServerDescriptor>,
    /// Owning user, when the flow is user-interactive. `None` for
    /// system-level client-credentials managers.
    user_id: Option<String>,
    http: Arc<reqwest::Client>,
    discovery: Arc<DiscoveryClient>,
    /// Cached token. Plain mutex for cheap snapshot reads; never held
    /// across an await.
    token: Mutex<Option<OAuthToken>>,
    /// Serializes refreshes so at most one is in flight per manager.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("server", &self.descriptor.name)
            .field("user", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Creates a manager for an OAuth-authenticated server.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfigParse`] when the descriptor's auth
    /// scheme is not one of the OAuth2 flows -- static schemes must
    /// never get a token manager.
    pub fn new(
        descriptor: Arc<ServerDescriptor>,
        user_id: Option<String>,
        http: Arc<reqwest::Client>,
        discovery: Arc<DiscoveryClient>,
    ) -> Result<Self> {
        if !descriptor.auth().is_oauth() {
            return Err(BrokerError::ConfigParse(format!(
                "token manager requested for non-OAuth server {}",
                descriptor.name
            ))
            .into());
        }
        Ok(Self {
            descriptor,
            user_id,
            http,
            discovery,
            token: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// The server this manager authenticates against.
    pub fn server_name(&self) -> &str {
        &self.descriptor.name
    }

    /// The user this manager belongs to, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Snapshot of the currently held token, expired or not.
    pub fn current_token(&self) -> Option<OAuthToken> {
        self.token.lock().expect("token lock poisoned").clone()
    }

    /// True when an access token is held (it may still be expired).
    pub fn has_token(&self) -> bool {
        self.token.lock().expect("token lock poisoned").is_some()
    }

    /// Subject identifier from the held token, when the authorization
    /// server reported one.
    pub fn subject(&self) -> Option<String> {
        self.token
            .lock()
            .expect("token lock poisoned")
            .as_ref()
            .and_then(|t| t.subject.clone())
    }

    /// Drops the held token so the next `get_token` runs a fresh
    /// acquisition. The manager itself stays usable for re-auth.
    pub fn clear(&self) {
        *self.token.lock().expect("token lock poisoned") = None;
    }

    /// Returns a valid access token, refreshing first when the cached
    /// one is missing or expired.
    ///
    /// Concurrent callers are serialized through a refresh gate, and a
    /// caller that was queued behind a successful refresh reuses its
    /// result instead of refreshing again.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::AuthRequired`] when the authorization-code flow
    ///   has no refresh token; the caller must run the interactive flow.
    /// - [`BrokerError::TokenAcquisition`] when the token endpoint
    ///   rejects the refresh or cannot be reached.
    /// - [`BrokerError::Discovery`] when no token endpoint is known and
    ///   discovery fails.
    pub async fn get_token(&self) -> Result<String> {
        if let Some(token) = self.current_token() {
            if !token.is_expired() {
                return Ok(token.access_token);
            }
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.current_token() {
            if !token.is_expired() {
                return Ok(token.access_token);
            }
        }

        let refreshed = self.refresh().await?;
        let access_token = refreshed.access_token.clone();
        *self.token.lock().expect("token lock poisoned") = Some(refreshed);
        Ok(access_token)
    }

    /// Computes the `Authorization: Bearer` header map for a request,
    /// acquiring or refreshing the token as needed.
    pub async fn auth_headers(&self) -> Result<HashMap<String, String>> {
        let token = self.get_token().await?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        Ok(headers)
    }

    /// Builds the RFC 6749 authorization URL for the interactive flow.
    ///
    /// Includes `response_type=code`, the client id, redirect URI,
    /// scope (when configured), and the caller's `state` nonce. When a
    /// PKCE challenge is supplied, `code_challenge` and
    /// `code_challenge_method=S256` are appended.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TokenAcquisition`] when no client id is
    /// configured or registered, and [`BrokerError::Discovery`] when no
    /// authorization endpoint can be resolved.
    pub async fn get_authorization_url(
        &self,
        state: &str,
        code_challenge: Option<&str>,
    ) -> Result<String> {
        let config = self.oauth_config()?;
        let authorization_url = self.effective_authorization_url().await?;
        let client_id = config.client_id.as_deref().ok_or_else(|| {
            BrokerError::TokenAcquisition(format!(
                "no client_id configured or registered for {}",
                self.descriptor.name
            ))
        })?;

        let mut url = url::Url::parse(&authorization_url)
            .map_err(|e| BrokerError::Discovery(format!("invalid authorization endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", client_id);
            query.append_pair("redirect_uri", &effective_redirect_uri(&config));
            if let Some(scope) = &config.scope {
                query.append_pair("scope", scope);
            }
            query.append_pair("state", state);
            if let Some(challenge) = code_challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair("code_challenge_method", "S256");
            }
        }
        Ok(url.to_string())
    }

    /// Exchanges an authorization code for tokens and stores the
    /// result.
    ///
    /// The PKCE `code_verifier` must be supplied when the matching
    /// authorization URL carried a challenge. On success the new token
    /// (including any subject identifier the server reported) replaces
    /// the cached one and is also returned.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TokenAcquisition`] when the endpoint
    /// rejects the exchange.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<OAuthToken> {
        let config = self.oauth_config()?;
        let token_url = self.effective_token_url().await?;
        let redirect_uri = effective_redirect_uri(&config);

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", &redirect_uri);
        if let Some(client_id) = config.client_id.as_deref() {
            params.insert("client_id", client_id);
        }
        if let Some(client_secret) = config.client_secret.as_deref() {
            params.insert("client_secret", client_secret);
        }
        if let Some(verifier) = code_verifier {
            params.insert("code_verifier", verifier);
        }

        let token = self.post_token_request(&token_url, &params, &config).await?;
        *self.token.lock().expect("token lock poisoned") = Some(token.clone());
        Ok(token)
    }

    /// Resolves the token endpoint: manual configuration wins, then
    /// cached or fresh discovery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Discovery`] when neither source yields an
    /// endpoint. This is the explicitly-required discovery path, so
    /// failure is an error rather than a fallback.
    pub async fn effective_token_url(&self) -> Result<String> {
        let config = self.oauth_config()?;
        if let Some(manual) = &config.token_url {
            return Ok(manual.clone());
        }
        let metadata = self.discover(&config).await?;
        Ok(metadata.token_endpoint)
    }

    /// Resolves the authorization endpoint: manual configuration wins,
    /// then discovery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Discovery`] when neither source yields an
    /// endpoint.
    pub async fn effective_authorization_url(&self) -> Result<String> {
        let config = self.oauth_config()?;
        if let Some(manual) = &config.authorization_url {
            return Ok(manual.clone());
        }
        let metadata = self.discover(&config).await?;
        metadata.authorization_endpoint.ok_or_else(|| {
            BrokerError::Discovery(format!(
                "no authorization endpoint available for {} from manual config or discovery",
                self.descriptor.name
            ))
            .into()
        })
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Snapshot of the OAuth configuration; an error for static schemes
    /// (which cannot happen for a properly constructed manager).
    fn oauth_config(&self) -> Result<OAuthConfig> {
        match self.descriptor.auth() {
            AuthDescriptor::ClientCredentials(config)
            | AuthDescriptor::AuthorizationCode(config) => Ok(config),
            other => Err(BrokerError::ConfigParse(format!(
                "server {} no longer carries OAuth configuration (found {})",
                self.descriptor.name,
                other.type_name()
            ))
            .into()),
        }
    }

    /// Runs required discovery for this server with the configured base
    /// and timeout.
    async fn discover(&self, config: &OAuthConfig) -> Result<crate::auth::discovery::AuthServerMetadata> {
        if !config.enable_discovery {
            return Err(BrokerError::Discovery(format!(
                "no endpoint configured for {} and discovery is disabled",
                self.descriptor.name
            ))
            .into());
        }
        let base = config
            .discovery_url
            .clone()
            .or_else(|| self.descriptor.base_url())
            .ok_or_else(|| {
                BrokerError::Discovery(format!(
                    "no discovery base available for {}",
                    self.descriptor.name
                ))
            })?;
        self.discovery
            .discover(
                &self.descriptor.name,
                &base,
                Duration::from_secs(config.discovery_timeout),
            )
            .await
    }

    /// Flow dispatch for an expired or missing token.
    async fn refresh(&self) -> Result<OAuthToken> {
        match self.descriptor.auth() {
            AuthDescriptor::ClientCredentials(config) => {
                self.refresh_client_credentials(&config).await
            }
            AuthDescriptor::AuthorizationCode(config) => {
                let refresh_token = self
                    .current_token()
                    .and_then(|t| t.refresh_token)
                    .ok_or_else(|| {
                        BrokerError::AuthRequired(format!(
                            "no refresh token held for {}; user must re-authenticate",
                            self.descriptor.name
                        ))
                    })?;
                self.refresh_with_refresh_token(&config, &refresh_token)
                    .await
            }
            other => Err(BrokerError::ConfigParse(format!(
                "cannot refresh token for auth type {}",
                other.type_name()
            ))
            .into()),
        }
    }

    /// `grant_type=client_credentials` refresh.
    async fn refresh_client_credentials(&self, config: &OAuthConfig) -> Result<OAuthToken> {
        let client_id = config.client_id.as_deref().ok_or_else(|| {
            BrokerError::TokenAcquisition(format!(
                "no client_id configured for {}",
                self.descriptor.name
            ))
        })?;
        let token_url = self.effective_token_url().await?;

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "client_credentials");
        params.insert("client_id", client_id);
        if let Some(secret) = config.client_secret.as_deref() {
            params.insert("client_secret", secret);
        }
        if let Some(scope) = config.scope.as_deref() {
            params.insert("scope", scope);
        }

        self.post_token_request(&token_url, &params, config).await
    }

    /// `grant_type=refresh_token` refresh for the authorization-code
    /// flow.
    async fn refresh_with_refresh_token(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<OAuthToken> {
        let token_url = self.effective_token_url().await?;

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        if let Some(client_id) = config.client_id.as_deref() {
            params.insert("client_id", client_id);
        }
        if let Some(secret) = config.client_secret.as_deref() {
            params.insert("client_secret", secret);
        }

        let mut token = self.post_token_request(&token_url, &params, config).await?;
        // Servers that do not rotate refresh tokens omit them from the
        // response; keep the one we already hold.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    /// POSTs a form-encoded token request and parses the response.
    async fn post_token_request(
        &self,
        token_url: &str,
        params: &HashMap<&str, &str>,
        config: &OAuthConfig,
    ) -> Result<OAuthToken> {
        let response = self
            .http
            .post(token_url)
            .timeout(Duration::from_secs(self.descriptor.timeout))
            .form(params)
            .send()
            .await
            .map_err(|e| {
                BrokerError::TokenAcquisition(format!(
                    "token request failed for {}: {e}",
                    self.descriptor.name
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::TokenAcquisition(format!(
                "token endpoint returned {status} for {}: {body}",
                self.descriptor.name
            ))
            .into());
        }

        let raw: TokenResponse = response.json().await.map_err(|e| {
            BrokerError::TokenAcquisition(format!(
                "invalid token response for {}: {e}",
                self.descriptor.name
            ))
        })?;

        let session_client = if config.ephemeral_credentials {
            config.client_id.clone().map(|client_id| SessionClient {
                client_id,
                client_secret: config.client_secret.clone(),
            })
        } else {
            None
        };

        Ok(raw.into_token(session_client))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
