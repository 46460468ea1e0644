//! RFC 7591 dynamic client registration
//!
//! When a server advertises a `client_registration_url` and no
//! `client_id` is configured, the broker registers itself as an OAuth
//! client at runtime. The returned credentials live in the in-memory
//! descriptor only, tagged session-scoped: they are never written back
//! to the configuration document, so the file stays read-only across
//! restarts and the broker simply re-registers after a process restart.
//!
//! A [`ReregistrationPolicy`] knob controls what happens when an
//! authentication attempt starts while registered credentials already
//! exist: `Reuse` keeps them, `Always` discards and re-registers to
//! pick up redirect-URI changes.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::model::{OAuthConfig, ReregistrationPolicy, ServerDescriptor};
use crate::error::{BrokerError, Result};

/// Client name advertised to registration endpoints.
const CLIENT_NAME: &str = "capbroker";

/// Redirect URI used when neither the configuration nor the hosting
/// application provides one.
pub const FALLBACK_REDIRECT_URI: &str = "http://localhost:8080/oauth/callback";

/// Resolves the redirect URI for a flow: the configured value when
/// present, otherwise the documented fallback.
pub fn effective_redirect_uri(config: &OAuthConfig) -> String {
    config
        .redirect_uri
        .clone()
        .unwrap_or_else(|| FALLBACK_REDIRECT_URI.to_string())
}

/// Minimal RFC 7591 registration response.
#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// ClientRegistrar
// ---------------------------------------------------------------------------

/// Performs dynamic client registration against a server's registration
/// endpoint and applies the re-registration policy.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use capbroker::auth::registration::ClientRegistrar;
///
/// let registrar = ClientRegistrar::new(Arc::new(reqwest::Client::new()));
/// // registrar.ensure_client(&descriptor).await?;
/// ```
pub struct ClientRegistrar {
    http: Arc<reqwest::Client>,
}

impl ClientRegistrar {
    /// Creates a registrar sharing the broker's HTTP client.
    pub fn new(http: Arc<reqwest::Client>) -> Self {
        Self { http }
    }

    /// Makes sure the descriptor holds a usable `client_id` before an
    /// authentication attempt, registering dynamically when needed.
    ///
    /// Behaviour by current state:
    ///
    /// - `client_id` present, policy `Reuse`: nothing to do.
    /// - `client_id` present and session-scoped, policy `Always`: the
    ///   registration is cleared and redone so a changed redirect URI
    ///   is picked up.
    /// - No `client_id`, `client_registration_url` configured: register.
    /// - No `client_id`, no registration endpoint: left as-is; the flow
    ///   will fail later with a clear error when the client id is
    ///   actually required.
    ///
    /// Safe to call repeatedly and from concurrent attempts: the
    /// descriptor write is idempotent and a duplicate registration just
    /// overwrites the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Registration`] when a registration request
    /// was attempted and failed. Other servers are unaffected.
    pub async fn ensure_client(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let Some(config) = descriptor.auth().oauth_config().cloned() else {
            return Ok(());
        };

        if config.client_id.is_some() {
            match config.reregister {
                ReregistrationPolicy::Reuse => return Ok(()),
                ReregistrationPolicy::Always if config.ephemeral_credentials => {
                    tracing::debug!(
                        server = %descriptor.name,
                        "re-registration policy is `always`; discarding dynamic client"
                    );
                    descriptor.clear_registered_client();
                }
                // Statically provisioned credentials are never discarded.
                ReregistrationPolicy::Always => return Ok(()),
            }
        }

        let Some(registration_url) = config.client_registration_url.clone() else {
            return Ok(());
        };

        self.register(descriptor, &registration_url, &config).await
    }

    /// POSTs a registration request and stores the returned credentials
    /// in the descriptor (memory only).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Registration`] when the request fails,
    /// the endpoint returns a non-success status, or the response body
    /// cannot be parsed.
    async fn register(
        &self,
        descriptor: &ServerDescriptor,
        registration_url: &str,
        config: &OAuthConfig,
    ) -> Result<()> {
        let redirect_uri = effective_redirect_uri(config);

        let mut payload = serde_json::json!({
            "client_name": CLIENT_NAME,
            "redirect_uris": [redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "token_endpoint_auth_method": "client_secret_post",
        });
        if let Some(scope) = &config.scope {
            payload["scope"] = serde_json::Value::String(scope.clone());
        }

        tracing::info!(
            server = %descriptor.name,
            endpoint = %registration_url,
            "attempting dynamic client registration"
        );

        let response = self
            .http
            .post(registration_url)
            .timeout(Duration::from_secs(descriptor.timeout))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                BrokerError::Registration(format!(
                    "registration request failed for {}: {e}",
                    descriptor.name
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Registration(format!(
                "registration endpoint returned {status} for {}: {body}",
                descriptor.name
            ))
            .into());
        }

        let registered: RegistrationResponse = response.json().await.map_err(|e| {
            BrokerError::Registration(format!(
                "invalid registration response for {}: {e}",
                descriptor.name
            ))
        })?;

        tracing::info!(
            server = %descriptor.name,
            "registered dynamic client; credentials held in memory only"
        );
        descriptor.store_registered_client(registered.client_id, registered.client_secret);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{AuthDescriptor, TransportKind};
    use std::collections::HashMap;

    fn make_descriptor(config: OAuthConfig) -> ServerDescriptor {
        ServerDescriptor::new(
            "srv".to_string(),
            TransportKind::Sse,
            None,
            vec![],
            HashMap::new(),
            Some("https://api.example.com/tools".to_string()),
            5,
            None,
            AuthDescriptor::AuthorizationCode(config),
        )
    }

    // -----------------------------------------------------------------------
    // effective_redirect_uri
    // -----------------------------------------------------------------------

    #[test]
    fn test_effective_redirect_uri_prefers_configured_value() {
        let config = OAuthConfig {
            redirect_uri: Some("https://app.example.com/oauth/callback".to_string()),
            ..OAuthConfig::default()
        };
        assert_eq!(
            effective_redirect_uri(&config),
            "https://app.example.com/oauth/callback"
        );
    }

    #[test]
    fn test_effective_redirect_uri_falls_back() {
        assert_eq!(
            effective_redirect_uri(&OAuthConfig::default()),
            FALLBACK_REDIRECT_URI
        );
    }

    // -----------------------------------------------------------------------
    // ensure_client short-circuits (network paths covered by wiremock in
    // tests/registration_test.rs)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_ensure_client_noop_for_static_auth() {
        let descriptor = ServerDescriptor::new(
            "srv".to_string(),
            TransportKind::Http,
            None,
            vec![],
            HashMap::new(),
            Some("https://api.example.com".to_string()),
            5,
            None,
            AuthDescriptor::Bearer {
                token: Some("tok".to_string()),
            },
        );
        let registrar = ClientRegistrar::new(Arc::new(reqwest::Client::new()));
        assert!(registrar.ensure_client(&descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_client_reuses_existing_client_id() {
        let descriptor = make_descriptor(OAuthConfig {
            client_id: Some("existing".to_string()),
            // A registration URL is configured, but Reuse must not call it.
            client_registration_url: Some("http://192.0.2.1:9/register".to_string()),
            ..OAuthConfig::default()
        });
        let registrar = ClientRegistrar::new(Arc::new(reqwest::Client::new()));
        assert!(registrar.ensure_client(&descriptor).await.is_ok());
        assert_eq!(
            descriptor.auth().oauth_config().unwrap().client_id.as_deref(),
            Some("existing")
        );
    }

    #[tokio::test]
    async fn test_ensure_client_noop_without_registration_url() {
        let descriptor = make_descriptor(OAuthConfig::default());
        let registrar = ClientRegistrar::new(Arc::new(reqwest::Client::new()));
        assert!(registrar.ensure_client(&descriptor).await.is_ok());
        assert!(descriptor.auth().oauth_config().unwrap().client_id.is_none());
    }

    #[tokio::test]
    async fn test_ensure_client_always_policy_keeps_static_credentials() {
        let descriptor = make_descriptor(OAuthConfig {
            client_id: Some("static-id".to_string()),
            reregister: ReregistrationPolicy::Always,
            client_registration_url: Some("http://192.0.2.1:9/register".to_string()),
            ..OAuthConfig::default()
        });
        let registrar = ClientRegistrar::new(Arc::new(reqwest::Client::new()));
        // Static credentials are not ephemeral, so Always must not clear them.
        assert!(registrar.ensure_client(&descriptor).await.is_ok());
        assert_eq!(
            descriptor.auth().oauth_config().unwrap().client_id.as_deref(),
            Some("static-id")
        );
    }
}
