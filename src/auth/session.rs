//! Multi-tenant session registry for OAuth token managers
//!
//! The [`UserSessionStore`] maps (user, server) pairs to their
//! [`TokenManager`] and tracks the single-use CSRF state tokens for the
//! authorization-code redirect dance.
//!
//! Concurrent authentication flows for different users against the same
//! server never collide: each gets an independently random state token
//! and an independent manager. A state token is consumed exactly once;
//! presenting an unknown, expired, or already-consumed state is
//! rejected as a potential CSRF attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::auth::discovery::DiscoveryClient;
use crate::auth::pkce::{generate_state, PkceChallenge};
use crate::auth::registration::ClientRegistrar;
use crate::auth::token::TokenManager;
use crate::config::loader::ServerRegistry;
use crate::config::model::{AuthDescriptor, ServerDescriptor};
use crate::error::{BrokerError, Result};

/// How long a pending authorization state stays redeemable.
const STATE_TTL_SECS: i64 = 600;

// ---------------------------------------------------------------------------
// PendingAuthState
// ---------------------------------------------------------------------------

/// Bookkeeping for one in-flight authorization redirect.
///
/// Created when an authorization URL is issued and removed either when
/// the callback consumes it or when it ages out of the expiry window.
#[derive(Debug, Clone)]
pub struct PendingAuthState {
    /// Server the authorization attempt targets.
    pub server_name: String,
    /// PKCE code verifier matching the challenge in the issued URL.
    pub code_verifier: Option<String>,
    /// Creation instant, for the expiry window.
    pub created_at: DateTime<Utc>,
}

impl PendingAuthState {
    fn is_expired(&self) -> bool {
        Utc::now() - self.created_at > chrono::Duration::seconds(STATE_TTL_SECS)
    }
}

/// Per-user slice of the store.
#[derive(Default)]
struct UserSession {
    /// server name -> token manager.
    managers: HashMap<String, Arc<TokenManager>>,
    /// state token -> pending authorization.
    pending: HashMap<String, PendingAuthState>,
}

// ---------------------------------------------------------------------------
// UserSessionStore
// ---------------------------------------------------------------------------

/// Registry of per-user token managers and pending authorization state.
///
/// Sessions are created on first access for a user and destroyed
/// wholesale on logout. The store is internally synchronized; the lock
/// is never held across an await point.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use capbroker::auth::discovery::DiscoveryClient;
/// use capbroker::auth::session::UserSessionStore;
///
/// let http = Arc::new(reqwest::Client::new());
/// let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
/// let store = UserSessionStore::new(http, discovery);
/// ```
pub struct UserSessionStore {
    http: Arc<reqwest::Client>,
    discovery: Arc<DiscoveryClient>,
    registrar: ClientRegistrar,
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl UserSessionStore {
    /// Creates an empty store sharing the broker's HTTP client and
    /// discovery cache.
    pub fn new(http: Arc<reqwest::Client>, discovery: Arc<DiscoveryClient>) -> Self {
        let registrar = ClientRegistrar::new(Arc::clone(&http));
        Self {
            http,
            discovery,
            registrar,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the token manager for (user, server), creating it on
    /// first access.
    ///
    /// Idempotent: an existing manager is never recreated, so cached
    /// tokens survive repeated lookups.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfigParse`] when the server's auth
    /// scheme is not an OAuth2 flow; static schemes never get a
    /// manager.
    pub fn get_or_create_token_manager(
        &self,
        user_id: &str,
        descriptor: &Arc<ServerDescriptor>,
    ) -> Result<Arc<TokenManager>> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let session = sessions.entry(user_id.to_string()).or_default();

        if let Some(existing) = session.managers.get(&descriptor.name) {
            return Ok(Arc::clone(existing));
        }

        tracing::info!(
            user = user_id,
            server = %descriptor.name,
            "creating token manager"
        );
        let manager = Arc::new(TokenManager::new(
            Arc::clone(descriptor),
            Some(user_id.to_string()),
            Arc::clone(&self.http),
            Arc::clone(&self.discovery),
        )?);
        session
            .managers
            .insert(descriptor.name.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Looks up an existing manager without creating one.
    pub fn get_token_manager(&self, user_id: &str, server_name: &str) -> Option<Arc<TokenManager>> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .get(user_id)?
            .managers
            .get(server_name)
            .cloned()
    }

    /// Records a pending authorization under a state token.
    pub fn store_oauth_state(
        &self,
        user_id: &str,
        state: &str,
        server_name: &str,
        code_verifier: Option<String>,
    ) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let session = sessions.entry(user_id.to_string()).or_default();
        session.pending.insert(
            state.to_string(),
            PendingAuthState {
                server_name: server_name.to_string(),
                code_verifier,
                created_at: Utc::now(),
            },
        );
    }

    /// Consumes a pending authorization state, exactly once.
    ///
    /// Returns `None` when the state is unknown, already consumed, or
    /// older than the expiry window; all three cases must be treated by
    /// the caller as a CSRF rejection. Expired entries are pruned.
    pub fn take_oauth_state(&self, user_id: &str, state: &str) -> Option<PendingAuthState> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let session = sessions.get_mut(user_id)?;
        let pending = session.pending.remove(state)?;
        if pending.is_expired() {
            tracing::warn!(user = user_id, "rejecting expired authorization state");
            return None;
        }
        Some(pending)
    }

    /// True when the user holds an access token for the server (the
    /// token may still be expired; refresh is the manager's job).
    pub fn has_valid_tokens(&self, user_id: &str, server_name: &str) -> bool {
        self.get_token_manager(user_id, server_name)
            .map(|manager| manager.has_token())
            .unwrap_or(false)
    }

    /// Disconnects one server for a user: the tokens are dropped but
    /// the manager stays, ready for re-authentication.
    pub fn clear_tokens(&self, user_id: &str, server_name: &str) {
        if let Some(manager) = self.get_token_manager(user_id, server_name) {
            manager.clear();
        }
    }

    /// Full logout: discards every manager and pending state for the
    /// user.
    pub fn clear_user_session(&self, user_id: &str) {
        let removed = self
            .sessions
            .lock()
            .expect("session lock poisoned")
            .remove(user_id);
        if removed.is_some() {
            tracing::info!(user = user_id, "cleared user session");
        }
    }

    /// Servers using the user-interactive flow for which this user
    /// holds no token yet.
    pub fn servers_needing_user_auth(&self, user_id: &str, registry: &ServerRegistry) -> Vec<String> {
        registry
            .list_servers()
            .into_iter()
            .filter(|name| {
                let Some(descriptor) = registry.get(name) else {
                    return false;
                };
                matches!(descriptor.auth(), AuthDescriptor::AuthorizationCode(_))
                    && !self.has_valid_tokens(user_id, name)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Authorization flow glue
    // -----------------------------------------------------------------------

    /// Starts an interactive authorization attempt for (user, server).
    ///
    /// Ensures a client registration exists (per the server's
    /// re-registration policy), generates a fresh state nonce and PKCE
    /// pair, records the pending state, and returns the authorization
    /// URL the user must visit.
    ///
    /// # Errors
    ///
    /// Propagates registration, discovery, and URL-building failures
    /// from the underlying components.
    pub async fn begin_authorization(
        &self,
        user_id: &str,
        descriptor: &Arc<ServerDescriptor>,
    ) -> Result<String> {
        self.registrar.ensure_client(descriptor).await?;
        let manager = self.get_or_create_token_manager(user_id, descriptor)?;

        let state = generate_state();
        let pkce = PkceChallenge::generate();
        self.store_oauth_state(user_id, &state, &descriptor.name, Some(pkce.verifier.clone()));

        manager
            .get_authorization_url(&state, Some(&pkce.challenge))
            .await
    }

    /// Completes an authorization attempt from the redirect callback.
    ///
    /// The state token is consumed (single use) and the authorization
    /// code exchanged with the PKCE verifier recorded at
    /// [`begin_authorization`](Self::begin_authorization). Returns the
    /// manager now holding the tokens.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AuthRequired`] for an unknown, expired,
    /// or reused state (CSRF rejection) and propagates exchange
    /// failures.
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        state: &str,
        code: &str,
    ) -> Result<Arc<TokenManager>> {
        let pending = self.take_oauth_state(user_id, state).ok_or_else(|| {
            BrokerError::AuthRequired(
                "unknown or already-used authorization state; restart the flow".to_string(),
            )
        })?;

        let manager = self
            .get_token_manager(user_id, &pending.server_name)
            .ok_or_else(|| BrokerError::UnknownServer(pending.server_name.clone()))?;

        manager
            .exchange_authorization_code(code, pending.code_verifier.as_deref())
            .await?;
        Ok(manager)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{OAuthConfig, TransportKind};

    fn make_store() -> UserSessionStore {
        let http = Arc::new(reqwest::Client::new());
        let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
        UserSessionStore::new(http, discovery)
    }

    fn oauth_descriptor(name: &str) -> Arc<ServerDescriptor> {
        Arc::new(ServerDescriptor::new(
            name.to_string(),
            TransportKind::Sse,
            None,
            vec![],
            HashMap::new(),
            Some(format!("https://{name}.example.com/tools")),
            5,
            None,
            AuthDescriptor::AuthorizationCode(OAuthConfig::default()),
        ))
    }

    fn bearer_descriptor(name: &str) -> Arc<ServerDescriptor> {
        Arc::new(ServerDescriptor::new(
            name.to_string(),
            TransportKind::Http,
            None,
            vec![],
            HashMap::new(),
            Some(format!("https://{name}.example.com")),
            5,
            None,
            AuthDescriptor::Bearer {
                token: Some("tok".to_string()),
            },
        ))
    }

    // -----------------------------------------------------------------------
    // get_or_create_token_manager
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");

        let first = store.get_or_create_token_manager("alice", &descriptor).unwrap();
        let second = store.get_or_create_token_manager("alice", &descriptor).unwrap();
        assert!(
            Arc::ptr_eq(&first, &second),
            "repeated lookups must return the same manager"
        );
    }

    #[test]
    fn test_get_or_create_rejects_static_auth() {
        let store = make_store();
        let descriptor = bearer_descriptor("srv");
        assert!(store.get_or_create_token_manager("alice", &descriptor).is_err());
    }

    #[test]
    fn test_users_get_independent_managers() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");

        let alice = store.get_or_create_token_manager("alice", &descriptor).unwrap();
        let bob = store.get_or_create_token_manager("bob", &descriptor).unwrap();
        assert!(
            !Arc::ptr_eq(&alice, &bob),
            "different users must get independent managers"
        );
    }

    #[test]
    fn test_get_token_manager_without_create() {
        let store = make_store();
        assert!(store.get_token_manager("alice", "srv").is_none());

        let descriptor = oauth_descriptor("srv");
        store.get_or_create_token_manager("alice", &descriptor).unwrap();
        assert!(store.get_token_manager("alice", "srv").is_some());
    }

    // -----------------------------------------------------------------------
    // State token lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn test_state_is_consumed_exactly_once() {
        let store = make_store();
        store.store_oauth_state("alice", "state1", "srv", Some("verifier".to_string()));

        let first = store.take_oauth_state("alice", "state1");
        assert!(first.is_some());
        assert_eq!(first.unwrap().server_name, "srv");

        let second = store.take_oauth_state("alice", "state1");
        assert!(second.is_none(), "a state token must be single-use");
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let store = make_store();
        assert!(store.take_oauth_state("alice", "never-stored").is_none());
    }

    #[test]
    fn test_state_is_scoped_to_user() {
        let store = make_store();
        store.store_oauth_state("alice", "state1", "srv", None);
        assert!(
            store.take_oauth_state("bob", "state1").is_none(),
            "one user's state must not redeem for another"
        );
        assert!(store.take_oauth_state("alice", "state1").is_some());
    }

    #[test]
    fn test_expired_state_is_rejected() {
        let store = make_store();
        store.store_oauth_state("alice", "state1", "srv", None);

        // Age the entry past the window by editing its timestamp.
        {
            let mut sessions = store.sessions.lock().unwrap();
            let pending = sessions
                .get_mut("alice")
                .unwrap()
                .pending
                .get_mut("state1")
                .unwrap();
            pending.created_at = Utc::now() - chrono::Duration::seconds(STATE_TTL_SECS + 1);
        }

        assert!(store.take_oauth_state("alice", "state1").is_none());
    }

    #[test]
    fn test_state_carries_code_verifier() {
        let store = make_store();
        store.store_oauth_state("alice", "s", "srv", Some("the-verifier".to_string()));
        let pending = store.take_oauth_state("alice", "s").unwrap();
        assert_eq!(pending.code_verifier.as_deref(), Some("the-verifier"));
    }

    // -----------------------------------------------------------------------
    // Token presence and clearing
    // -----------------------------------------------------------------------

    #[test]
    fn test_has_valid_tokens_false_without_manager() {
        let store = make_store();
        assert!(!store.has_valid_tokens("alice", "srv"));
    }

    #[test]
    fn test_has_valid_tokens_false_before_any_token() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");
        store.get_or_create_token_manager("alice", &descriptor).unwrap();
        assert!(!store.has_valid_tokens("alice", "srv"));
    }

    #[test]
    fn test_clear_tokens_keeps_manager_for_reauth() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");
        let manager = store.get_or_create_token_manager("alice", &descriptor).unwrap();

        store.clear_tokens("alice", "srv");

        let again = store.get_or_create_token_manager("alice", &descriptor).unwrap();
        assert!(
            Arc::ptr_eq(&manager, &again),
            "clear_tokens must not discard the manager"
        );
    }

    #[test]
    fn test_clear_user_session_discards_everything() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");
        store.get_or_create_token_manager("alice", &descriptor).unwrap();
        store.store_oauth_state("alice", "s", "srv", None);

        store.clear_user_session("alice");

        assert!(store.get_token_manager("alice", "srv").is_none());
        assert!(store.take_oauth_state("alice", "s").is_none());
    }

    #[test]
    fn test_clear_user_session_leaves_other_users_alone() {
        let store = make_store();
        let descriptor = oauth_descriptor("srv");
        store.get_or_create_token_manager("alice", &descriptor).unwrap();
        store.get_or_create_token_manager("bob", &descriptor).unwrap();

        store.clear_user_session("alice");

        assert!(store.get_token_manager("bob", "srv").is_some());
    }

    // -----------------------------------------------------------------------
    // servers_needing_user_auth
    // -----------------------------------------------------------------------

    #[test]
    fn test_servers_needing_user_auth_lists_interactive_servers() {
        let registry = ServerRegistry::parse(
            r#"{
                "mcpServers": {
                    "interactive": {
                        "transport": "sse", "url": "https://i.example.com",
                        "auth": { "type": "oauth2_authorization_code",
                                  "requires_user_auth": true }
                    },
                    "machine": {
                        "transport": "http", "url": "https://m.example.com",
                        "auth": { "type": "bearer", "token": "t" }
                    }
                }
            }"#,
        )
        .unwrap();

        let store = make_store();
        let needing = store.servers_needing_user_auth("alice", &registry);
        assert_eq!(needing, vec!["interactive".to_string()]);
    }

    // -----------------------------------------------------------------------
    // complete_authorization CSRF rejection (exchange paths covered by
    // wiremock in tests/token_manager_test.rs)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_complete_authorization_rejects_unknown_state() {
        let store = make_store();
        let result = store.complete_authorization("alice", "forged", "code").await;
        assert!(result.is_err());
        let err = result.unwrap_err();
        let broker_err = err.downcast_ref::<BrokerError>().expect("broker error");
        assert!(matches!(broker_err, BrokerError::AuthRequired(_)));
    }
}
