//! End-to-end authorization flow tests using wiremock
//!
//! Drives `UserSessionStore::begin_authorization` /
//! `complete_authorization` against a mock authorization server,
//! covering the interplay of dynamic registration, PKCE, CSRF state,
//! and per-user token managers:
//!
//! - Two users authenticating against the same server get distinct
//!   state tokens and land in distinct token managers.
//! - A state token redeems exactly once.
//! - Registered credentials never leak into the re-serialized catalog.

use std::sync::Arc;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use capbroker::auth::discovery::DiscoveryClient;
use capbroker::auth::session::UserSessionStore;
use capbroker::config::loader::ServerRegistry;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Catalog with one interactive OAuth server whose endpoints live on
/// the mock server.
fn catalog(base_url: &str) -> String {
    format!(
        r#"{{
            "mcpServers": {{
                "tools": {{
                    "transport": "sse",
                    "url": "{base_url}/stream",
                    "auth": {{
                        "type": "oauth2_authorization_code",
                        "requires_user_auth": true,
                        "authorization_url": "{base_url}/authorize",
                        "token_url": "{base_url}/token",
                        "client_registration_url": "{base_url}/register"
                    }}
                }}
            }}
        }}"#
    )
}

fn make_store() -> UserSessionStore {
    let http = Arc::new(reqwest::Client::new());
    let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
    UserSessionStore::new(http, discovery)
}

/// Extracts the `state` query parameter from an authorization URL.
fn state_from_url(auth_url: &str) -> String {
    let url = url::Url::parse(auth_url).expect("authorization URL must parse");
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.to_string())
        .expect("authorization URL must carry a state")
}

async fn mount_registration(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "client_id": "dyn-client",
            "client_secret": "dyn-secret"
        })))
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// Concurrent users
// ---------------------------------------------------------------------------

/// Two users against the same server: independent states, independent
/// managers, no token cross-contamination.
#[tokio::test]
async fn test_two_users_complete_independent_flows() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    // Each user's code exchanges for their own access token.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=code-alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "token-alice",
            "token_type": "Bearer",
            "expires_in": 3600,
            "sub": "alice"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=code-bob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "token-bob",
            "token_type": "Bearer",
            "expires_in": 3600,
            "sub": "bob"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    // Both flows begin before either callback arrives.
    let alice_url = store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("alice authorization URL");
    let bob_url = store
        .begin_authorization("bob", &descriptor)
        .await
        .expect("bob authorization URL");

    let alice_state = state_from_url(&alice_url);
    let bob_state = state_from_url(&bob_url);
    assert_ne!(alice_state, bob_state, "states must be independent");

    // Callbacks resolve to each user's own manager.
    let alice_manager = store
        .complete_authorization("alice", &alice_state, "code-alice")
        .await
        .expect("alice exchange");
    let bob_manager = store
        .complete_authorization("bob", &bob_state, "code-bob")
        .await
        .expect("bob exchange");

    assert!(!Arc::ptr_eq(&alice_manager, &bob_manager));
    assert_eq!(
        alice_manager.current_token().unwrap().access_token,
        "token-alice"
    );
    assert_eq!(
        bob_manager.current_token().unwrap().access_token,
        "token-bob"
    );
    assert_eq!(alice_manager.subject().as_deref(), Some("alice"));
    assert_eq!(bob_manager.subject().as_deref(), Some("bob"));

    assert!(store.has_valid_tokens("alice", "tools"));
    assert!(store.has_valid_tokens("bob", "tools"));
}

// ---------------------------------------------------------------------------
// Single-use state
// ---------------------------------------------------------------------------

/// Replaying a consumed state fails as a CSRF rejection, even with a
/// fresh code.
#[tokio::test]
async fn test_state_cannot_be_exchanged_twice() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "token-1",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    let auth_url = store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("authorization URL");
    let state = state_from_url(&auth_url);

    store
        .complete_authorization("alice", &state, "code-1")
        .await
        .expect("first exchange succeeds");

    let replay = store
        .complete_authorization("alice", &state, "code-2")
        .await;
    assert!(replay.is_err(), "a state token must redeem at most once");
}

/// A forged state that was never issued is rejected outright.
#[tokio::test]
async fn test_forged_state_is_rejected() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("authorization URL");

    let result = store
        .complete_authorization("alice", "forged-state", "code")
        .await;
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Authorization URL contents
// ---------------------------------------------------------------------------

/// The issued URL carries the dynamically registered client and a PKCE
/// challenge.
#[tokio::test]
async fn test_begin_authorization_builds_pkce_url_with_registered_client() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    let auth_url = store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("authorization URL");

    assert!(auth_url.contains("client_id=dyn-client"), "url: {auth_url}");
    assert!(auth_url.contains("response_type=code"), "url: {auth_url}");
    assert!(auth_url.contains("code_challenge="), "url: {auth_url}");
    assert!(
        auth_url.contains("code_challenge_method=S256"),
        "url: {auth_url}"
    );
}

/// The exchange POST carries the PKCE verifier recorded at begin time.
#[tokio::test]
async fn test_exchange_sends_recorded_code_verifier() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "token-1",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    let auth_url = store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("authorization URL");
    let state = state_from_url(&auth_url);

    store
        .complete_authorization("alice", &state, "code-1")
        .await
        .expect("exchange with verifier succeeds");
}

// ---------------------------------------------------------------------------
// Catalog hygiene
// ---------------------------------------------------------------------------

/// After a full registration + authorization round, the re-serialized
/// catalog still carries no dynamic credentials.
#[tokio::test]
async fn test_registered_credentials_never_reach_serialized_catalog() {
    let server = MockServer::start().await;
    mount_registration(&server).await;

    let registry = ServerRegistry::parse(&catalog(&server.uri())).unwrap();
    let descriptor = registry.get("tools").unwrap();
    let store = make_store();

    store
        .begin_authorization("alice", &descriptor)
        .await
        .expect("authorization URL");

    let serialized = serde_json::to_string(&registry.to_document()).unwrap();
    assert!(
        !serialized.contains("dyn-client"),
        "client_id must not be serialized"
    );
    assert!(
        !serialized.contains("dyn-secret"),
        "client_secret must not be serialized"
    );
}
