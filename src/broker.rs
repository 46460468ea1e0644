//! Top-level broker context
//!
//! A [`Broker`] wires the registry, discovery cache, session store, and
//! connection manager together around one shared HTTP client. It is
//! constructed explicitly at process start and passed by reference to
//! whatever hosts it -- there are no module-level singletons, which
//! keeps tests hermetic and shutdown deterministic.

use std::path::Path;
use std::sync::Arc;

use crate::auth::discovery::DiscoveryClient;
use crate::auth::session::UserSessionStore;
use crate::config::loader::ServerRegistry;
use crate::connection::ConnectionManager;
use crate::error::Result;

/// Process-wide broker state.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use capbroker::broker::Broker;
///
/// # async fn example() -> capbroker::error::Result<()> {
/// let broker = Broker::open(Path::new("capbroker.json")).await?;
/// let connected = broker.connections.connect_group("research", Some("alice")).await;
/// println!("connected: {connected:?}");
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Broker {
    /// The loaded server catalog.
    pub registry: Arc<ServerRegistry>,
    /// Shared discovery cache.
    pub discovery: Arc<DiscoveryClient>,
    /// Per-user token managers and CSRF state.
    pub sessions: Arc<UserSessionStore>,
    /// Transport sessions.
    pub connections: ConnectionManager,
}

impl Broker {
    /// Assembles a broker around an already-parsed registry.
    ///
    /// Callers that need automatic OAuth discovery must still await
    /// [`ServerRegistry::initialize`]; [`open`](Self::open) does both
    /// steps.
    pub fn new(registry: ServerRegistry) -> Self {
        let registry = Arc::new(registry);
        let http = Arc::new(reqwest::Client::new());
        let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&http)));
        let sessions = Arc::new(UserSessionStore::new(
            Arc::clone(&http),
            Arc::clone(&discovery),
        ));
        let connections = ConnectionManager::new(
            Arc::clone(&registry),
            http,
            Arc::clone(&sessions),
            Arc::clone(&discovery),
        );

        Self {
            registry,
            discovery,
            sessions,
            connections,
        }
    }

    /// Loads the catalog from `path` and runs the automatic discovery
    /// pass: the fully initialized, ready-to-use entry point.
    ///
    /// # Errors
    ///
    /// Propagates catalog parse and interpolation failures. Discovery
    /// failures are non-fatal by design and only logged.
    pub async fn open(path: &Path) -> Result<Self> {
        let registry = ServerRegistry::load(path)?;
        let broker = Self::new(registry);
        broker.registry.initialize(&broker.discovery).await;
        Ok(broker)
    }

    /// Deterministic shutdown: closes every tracked session.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_catalog_yields_working_empty_broker() {
        let broker = Broker::open(Path::new("/nonexistent/capbroker.json"))
            .await
            .unwrap();
        assert!(broker.registry.list_servers().is_empty());
        assert_eq!(broker.connections.session_count().await, 0);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_brokers_are_fully_independent() {
        let a = Broker::new(ServerRegistry::parse("{}").unwrap());
        let b = Broker::new(
            ServerRegistry::parse(
                r#"{ "mcpServers": { "srv": { "transport": "stdio", "command": "cat" } } }"#,
            )
            .unwrap(),
        );
        assert!(a.registry.list_servers().is_empty());
        assert_eq!(b.registry.list_servers().len(), 1);
    }
}
