//! Transport sessions and the connection manager
//!
//! [`ConnectionManager`] opens and closes transport-specific sessions,
//! asking the auth layer for fresh credentials on every connection
//! attempt and tearing sessions down safely. Per-server failures are
//! isolated: connecting a group returns the subset that succeeded.
//!
//! # Module Layout
//!
//! - `stdio` -- subprocess sessions (spawn, pipes, SIGTERM teardown)
//! - `sse`   -- long-lived streaming sessions with capability probe
//!
//! HTTP servers get no persistent connection at all: an [`HttpSession`]
//! only records how to compute headers, and recomputes them per call so
//! a token refresh is always picked up.

pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::discovery::DiscoveryClient;
use crate::auth::registration::ClientRegistrar;
use crate::auth::session::UserSessionStore;
use crate::auth::token::TokenManager;
use crate::config::loader::ServerRegistry;
use crate::config::model::{ServerDescriptor, TransportKind};
use crate::error::{BrokerError, Result};
use sse::SseSession;
use stdio::StdioSession;

// ---------------------------------------------------------------------------
// Session handles
// ---------------------------------------------------------------------------

/// A request-scoped HTTP "session".
///
/// Nothing is kept open; the handle stores the endpoint and the means
/// to compute auth headers, which callers must do per request.
#[derive(Debug)]
pub struct HttpSession {
    descriptor: Arc<ServerDescriptor>,
    manager: Option<Arc<TokenManager>>,
    url: String,
}

impl HttpSession {
    /// The server endpoint requests should target.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Computes fresh auth headers for one request.
    ///
    /// Static schemes resolve immediately; OAuth schemes go through the
    /// token manager, which refreshes first when the cached token has
    /// expired.
    pub async fn request_headers(&self) -> Result<HashMap<String, String>> {
        if let Some(headers) = self.descriptor.auth().static_headers()? {
            return Ok(headers);
        }
        let manager = self.manager.as_ref().ok_or_else(|| {
            BrokerError::TokenAcquisition(format!(
                "no token manager attached for {}",
                self.descriptor.name
            ))
        })?;
        manager.auth_headers().await
    }
}

/// One open session, shaped by the server's transport.
#[derive(Debug)]
pub enum SessionHandle {
    /// Running subprocess.
    Stdio(StdioSession),
    /// Per-call HTTP handle.
    Http(HttpSession),
    /// Open event stream.
    Sse(SseSession),
}

impl SessionHandle {
    /// Releases transport resources. Idempotent and infallible by
    /// construction: signalling a dead child or aborting a finished
    /// reader are no-ops.
    fn close(&self) {
        match self {
            SessionHandle::Stdio(session) => session.terminate(),
            SessionHandle::Sse(session) => session.close(),
            SessionHandle::Http(_) => {}
        }
    }
}

/// Sessions are keyed by (server, user) so that two users' connections
/// to the same server never alias.
type SessionKey = (String, Option<String>);

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Opens, tracks, and tears down sessions to capability servers.
///
/// Constructed once at process start and passed by reference; there is
/// no global instance. Shutdown is explicit:
/// [`shutdown`](Self::shutdown) from async code, or the best-effort
/// [`shutdown_blocking`](Self::shutdown_blocking) from a non-async
/// shutdown hook.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use capbroker::auth::discovery::DiscoveryClient;
/// use capbroker::auth::session::UserSessionStore;
/// use capbroker::config::ServerRegistry;
/// use capbroker::connection::ConnectionManager;
///
/// # async fn example() -> capbroker::error::Result<()> {
/// let http = Arc::new(reqwest::Client::new());
/// let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
/// let registry = Arc::new(ServerRegistry::parse("{}")?);
/// let sessions = Arc::new(UserSessionStore::new(Arc::clone(&http), Arc::clone(&discovery)));
/// let connections = ConnectionManager::new(registry, http, sessions, discovery);
///
/// let connected = connections.connect_group("research", Some("alice")).await;
/// println!("connected: {connected:?}");
/// connections.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    registry: Arc<ServerRegistry>,
    http: Arc<reqwest::Client>,
    session_store: Arc<UserSessionStore>,
    registrar: ClientRegistrar,
    discovery: Arc<DiscoveryClient>,
    /// Managers for machine flows used without a user context.
    system_managers: std::sync::Mutex<HashMap<String, Arc<TokenManager>>>,
    sessions: tokio::sync::Mutex<HashMap<SessionKey, Arc<SessionHandle>>>,
}

impl ConnectionManager {
    /// Creates a manager over the given registry, sharing the broker's
    /// HTTP client, session store, and discovery cache.
    pub fn new(
        registry: Arc<ServerRegistry>,
        http: Arc<reqwest::Client>,
        session_store: Arc<UserSessionStore>,
        discovery: Arc<DiscoveryClient>,
    ) -> Self {
        let registrar = ClientRegistrar::new(Arc::clone(&http));
        Self {
            registry,
            http,
            session_store,
            registrar,
            discovery,
            system_managers: std::sync::Mutex::new(HashMap::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Connects to one server, acquiring whatever credentials its auth
    /// scheme requires.
    ///
    /// Reconnecting an already-connected (server, user) pair replaces
    /// the old session; the replaced handle is closed.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::UnknownServer`] for names not in the catalog.
    /// - [`BrokerError::AuthRequired`] when the server needs an
    ///   interactive user flow and none has completed.
    /// - [`BrokerError::TokenAcquisition`] when credentials cannot be
    ///   produced.
    /// - [`BrokerError::Transport`] when the transport itself fails.
    pub async fn connect(&self, server_name: &str, user_id: Option<&str>) -> Result<()> {
        let descriptor = self.registry.require(server_name)?;

        let handle = match descriptor.transport {
            TransportKind::Stdio => self.connect_stdio(&descriptor)?,
            TransportKind::Http => self.connect_http(&descriptor, user_id).await?,
            TransportKind::Sse => self.connect_sse(&descriptor, user_id).await?,
        };

        let key = (server_name.to_string(), user_id.map(str::to_string));
        let replaced = self
            .sessions
            .lock()
            .await
            .insert(key, Arc::new(handle));
        if let Some(old) = replaced {
            old.close();
        }

        tracing::info!(
            server = server_name,
            user = user_id.unwrap_or("<system>"),
            transport = %descriptor.transport,
            "connected to capability server"
        );
        Ok(())
    }

    /// Connects a list of servers, returning the names that succeeded.
    /// Failures are logged and skipped; one bad server never aborts the
    /// rest.
    pub async fn connect_many(&self, server_names: &[String], user_id: Option<&str>) -> Vec<String> {
        let mut connected = Vec::new();
        for name in server_names {
            match self.connect(name, user_id).await {
                Ok(()) => connected.push(name.clone()),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "connection failed");
                }
            }
        }
        connected
    }

    /// Connects every member of a named group, in declared order,
    /// returning the successful subset.
    pub async fn connect_group(&self, group_name: &str, user_id: Option<&str>) -> Vec<String> {
        let members = self.registry.get_server_group(group_name);
        if members.is_empty() {
            tracing::warn!(group = group_name, "no servers found in group");
            return Vec::new();
        }
        self.connect_many(&members, user_id).await
    }

    /// Returns an open session for (server, user), if one exists.
    pub async fn session(
        &self,
        server_name: &str,
        user_id: Option<&str>,
    ) -> Option<Arc<SessionHandle>> {
        let key = (server_name.to_string(), user_id.map(str::to_string));
        self.sessions.lock().await.get(&key).cloned()
    }

    /// Closes every session to the named server, for all users.
    ///
    /// Idempotent: disconnecting a server with no open sessions (or
    /// disconnecting twice) is a no-op.
    pub async fn disconnect(&self, server_name: &str) {
        let removed: Vec<(SessionKey, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|(server, _)| server == server_name)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| sessions.remove(&key).map(|handle| (key.clone(), handle)))
                .collect()
        };

        for ((server, user), handle) in removed {
            handle.close();
            tracing::info!(
                server = %server,
                user = user.as_deref().unwrap_or("<system>"),
                "disconnected"
            );
        }
    }

    /// Closes every tracked session. One server's teardown problem
    /// never blocks the others; whatever goes wrong is logged, not
    /// propagated.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(SessionKey, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().collect()
        };

        for ((server, _), handle) in drained {
            handle.close();
            tracing::debug!(server = %server, "closed session during disconnect_all");
        }
    }

    /// Orderly shutdown owned by the process supervisor.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        tracing::info!("connection manager shut down");
    }

    /// Best-effort synchronous cleanup for non-async shutdown hooks.
    ///
    /// Never blocks: a contended session map is skipped, leaving child
    /// reaping to the OS. Prefer [`shutdown`](Self::shutdown) wherever
    /// an async context exists.
    pub fn shutdown_blocking(&self) {
        if let Ok(mut sessions) = self.sessions.try_lock() {
            for (_, handle) in sessions.drain() {
                handle.close();
            }
        }
    }

    /// Number of currently tracked sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    // -----------------------------------------------------------------------
    // Per-transport connect paths
    // -----------------------------------------------------------------------

    fn connect_stdio(&self, descriptor: &Arc<ServerDescriptor>) -> Result<SessionHandle> {
        let command = descriptor.command.as_deref().ok_or_else(|| {
            BrokerError::Transport(format!(
                "no command configured for stdio server {}",
                descriptor.name
            ))
        })?;
        let session = StdioSession::spawn(command, &descriptor.args, &descriptor.env)?;
        Ok(SessionHandle::Stdio(session))
    }

    async fn connect_http(
        &self,
        descriptor: &Arc<ServerDescriptor>,
        user_id: Option<&str>,
    ) -> Result<SessionHandle> {
        let url = self.require_url(descriptor)?;
        let manager = self.resolve_token_manager(descriptor, user_id).await?;

        let session = HttpSession {
            descriptor: Arc::clone(descriptor),
            manager,
            url,
        };
        // Compute headers once now so a misconfigured or unauthorized
        // server fails at connect time, not on the first request.
        session.request_headers().await?;
        Ok(SessionHandle::Http(session))
    }

    async fn connect_sse(
        &self,
        descriptor: &Arc<ServerDescriptor>,
        user_id: Option<&str>,
    ) -> Result<SessionHandle> {
        let url = self.require_url(descriptor)?;
        let manager = self.resolve_token_manager(descriptor, user_id).await?;

        let headers = match descriptor.auth().static_headers()? {
            Some(headers) => headers,
            None => {
                manager
                    .as_ref()
                    .ok_or_else(|| {
                        BrokerError::TokenAcquisition(format!(
                            "no token manager attached for {}",
                            descriptor.name
                        ))
                    })?
                    .auth_headers()
                    .await?
            }
        };

        let session = SseSession::open(&self.http, &url, &headers).await?;

        // Liveness probe; a failure here is suspicious but not fatal,
        // matching how flaky streaming servers behave in practice.
        let timeout = Duration::from_secs(descriptor.timeout);
        if let Err(e) = SseSession::probe(&self.http, &url, &headers, timeout).await {
            tracing::warn!(server = %descriptor.name, error = %e, "capability probe failed");
        }

        Ok(SessionHandle::Sse(session))
    }

    // -----------------------------------------------------------------------
    // Credential plumbing
    // -----------------------------------------------------------------------

    fn require_url(&self, descriptor: &ServerDescriptor) -> Result<String> {
        descriptor.url.clone().ok_or_else(|| {
            BrokerError::Transport(format!("no URL configured for server {}", descriptor.name))
                .into()
        })
    }

    /// Resolves the token manager for an OAuth server, or `None` for
    /// static schemes.
    ///
    /// User-interactive flows require a user context and go through the
    /// shared [`UserSessionStore`]; machine flows without a user get a
    /// system-level manager owned by this connection manager. Dynamic
    /// client registration runs first so the manager sees a usable
    /// client id.
    async fn resolve_token_manager(
        &self,
        descriptor: &Arc<ServerDescriptor>,
        user_id: Option<&str>,
    ) -> Result<Option<Arc<TokenManager>>> {
        let auth = descriptor.auth();
        let Some(config) = auth.oauth_config() else {
            return Ok(None);
        };

        if config.requires_user_auth && user_id.is_none() {
            return Err(BrokerError::AuthRequired(format!(
                "server {} requires user authentication",
                descriptor.name
            ))
            .into());
        }

        self.registrar.ensure_client(descriptor).await?;

        let manager = match user_id {
            Some(user) => self
                .session_store
                .get_or_create_token_manager(user, descriptor)?,
            None => {
                let mut managers = self
                    .system_managers
                    .lock()
                    .expect("system manager lock poisoned");
                match managers.get(&descriptor.name) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        let manager = Arc::new(TokenManager::new(
                            Arc::clone(descriptor),
                            None,
                            Arc::clone(&self.http),
                            Arc::clone(&self.discovery),
                        )?);
                        managers.insert(descriptor.name.clone(), Arc::clone(&manager));
                        manager
                    }
                }
            }
        };
        Ok(Some(manager))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
