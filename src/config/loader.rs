//! Server catalog loading
//!
//! Parses the declarative server catalog into a [`ServerRegistry`]. The
//! document supports two equivalent shapes, mergeable in the same file:
//!
//! - `mcpServers`: a name-keyed map of server objects
//! - `servers`: an array of server objects, each with a `name` field
//!
//! plus an optional top-level `serverGroups` map of named ordered server
//! lists. Every string in the document passes through environment
//! interpolation before being stored.
//!
//! # Two-phase initialization
//!
//! [`ServerRegistry::load`] is synchronous and only parses. Servers with
//! an `http`/`sse` transport, a URL, and no explicit `auth` block are
//! queued for automatic OAuth discovery; callers must await
//! [`ServerRegistry::initialize`] before first use to drain that queue.
//! Construction never leaves an unresolved discovery task behind.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::auth::discovery::DiscoveryClient;
use crate::config::interpolate::interpolate_value;
use crate::config::model::{AuthDescriptor, OAuthConfig, ServerDescriptor, TransportKind};
use crate::error::{BrokerError, Result};

/// Default per-server timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for automatic endpoint discovery during initialization.
const AUTO_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// ServerRegistry
// ---------------------------------------------------------------------------

/// The loaded server catalog: descriptors, groups, and the queue of
/// servers awaiting automatic OAuth discovery.
///
/// The registry is read-mostly after [`initialize`](Self::initialize);
/// the only later mutation is dynamic client registration writing
/// through each descriptor's interior lock.
///
/// # Examples
///
/// ```
/// use capbroker::config::loader::ServerRegistry;
///
/// let registry = ServerRegistry::parse(r#"{
///     "mcpServers": {
///         "search": {
///             "transport": "http",
///             "url": "https://search.example.com/tools",
///             "auth": { "type": "bearer", "token": "tok" }
///         }
///     }
/// }"#).unwrap();
///
/// assert_eq!(registry.list_servers(), vec!["search".to_string()]);
/// ```
#[derive(Debug)]
pub struct ServerRegistry {
    servers: HashMap<String, Arc<ServerDescriptor>>,
    /// Server names in document order, for stable listings.
    order: Vec<String>,
    /// Group name -> member names in declared order.
    groups: Vec<(String, Vec<String>)>,
    /// Servers queued for automatic OAuth discovery.
    pending_discovery: Mutex<Vec<String>>,
}

impl ServerRegistry {
    /// Loads the catalog from a file.
    ///
    /// A missing file is not an error: the loader logs a warning and
    /// returns an empty registry so that a fresh installation can boot
    /// before any servers are configured.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConfigParse`] for malformed JSON, unknown
    /// transport/auth types, and [`BrokerError::Interpolation`] for
    /// unresolvable `${VAR}` references. These abort the load for the
    /// whole document.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "server catalog not found; starting with an empty registry"
            );
            return Ok(Self::empty());
        }

        let text = std::fs::read_to_string(path)?;
        let registry = Self::parse(&text)?;
        tracing::info!(
            path = %path.display(),
            servers = registry.servers.len(),
            groups = registry.groups.len(),
            "loaded server catalog"
        );
        Ok(registry)
    }

    /// Parses the catalog from a JSON string.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`load`](Self::load).
    pub fn parse(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| BrokerError::ConfigParse(format!("malformed catalog JSON: {e}")))?;
        let document = interpolate_value(document)?;

        let mut registry = Self::empty();

        // Shape 1: name-keyed map under `mcpServers`.
        if let Some(map) = document.get("mcpServers").and_then(|v| v.as_object()) {
            for (name, entry) in map {
                registry.insert_entry(name.clone(), entry)?;
            }
        }

        // Shape 2: array under `servers`, each entry carrying its name.
        if let Some(entries) = document.get("servers").and_then(|v| v.as_array()) {
            for entry in entries {
                match entry.get("name").and_then(|n| n.as_str()) {
                    Some(name) => registry.insert_entry(name.to_string(), entry)?,
                    None => {
                        tracing::warn!("skipping server entry without a name");
                    }
                }
            }
        }

        if let Some(groups) = document.get("serverGroups").and_then(|v| v.as_object()) {
            for (group_name, members) in groups {
                let members = members
                    .as_array()
                    .ok_or_else(|| {
                        BrokerError::ConfigParse(format!(
                            "server group {group_name} must be an array of server names"
                        ))
                    })?
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect();
                registry.groups.push((group_name.clone(), members));
            }
        }

        Ok(registry)
    }

    /// Drains the automatic-discovery queue.
    ///
    /// For each queued server the well-known document is fetched from
    /// the server's base URL. When the document carries both a token
    /// and an authorization endpoint, the server is reconfigured for
    /// the user-interactive authorization-code flow with the discovered
    /// endpoints; otherwise it stays unauthenticated. Failures here are
    /// never fatal.
    pub async fn initialize(&self, discovery: &DiscoveryClient) {
        let queued: Vec<String> = {
            let mut pending = self
                .pending_discovery
                .lock()
                .expect("discovery queue lock poisoned");
            std::mem::take(&mut *pending)
        };

        for name in queued {
            let Some(descriptor) = self.servers.get(&name) else {
                continue;
            };
            let Some(base) = descriptor.base_url() else {
                continue;
            };

            match discovery
                .try_discover(&name, &base, AUTO_DISCOVERY_TIMEOUT)
                .await
            {
                Some(metadata) if metadata.authorization_endpoint.is_some() => {
                    tracing::info!(
                        server = %name,
                        token_endpoint = %metadata.token_endpoint,
                        "configured OAuth from discovered metadata"
                    );
                    descriptor.set_auth(AuthDescriptor::AuthorizationCode(OAuthConfig {
                        token_url: Some(metadata.token_endpoint),
                        authorization_url: metadata.authorization_endpoint,
                        client_registration_url: metadata.registration_endpoint,
                        discovery_url: Some(base),
                        requires_user_auth: true,
                        ..OAuthConfig::default()
                    }));
                }
                Some(_) => {
                    tracing::info!(
                        server = %name,
                        "discovered metadata lacks an authorization endpoint; \
                         leaving server unauthenticated"
                    );
                }
                None => {
                    tracing::info!(
                        server = %name,
                        "no OAuth discovered; server will be accessible without authentication"
                    );
                }
            }
        }
    }

    /// Returns the descriptor for a named server.
    pub fn get(&self, name: &str) -> Option<Arc<ServerDescriptor>> {
        self.servers.get(name).cloned()
    }

    /// Returns the descriptor for a named server or an error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownServer`] for names not in the
    /// catalog.
    pub fn require(&self, name: &str) -> Result<Arc<ServerDescriptor>> {
        self.get(name)
            .ok_or_else(|| BrokerError::UnknownServer(name.to_string()).into())
    }

    /// All server names in document order.
    pub fn list_servers(&self) -> Vec<String> {
        self.order.clone()
    }

    /// All group names in document order.
    pub fn list_groups(&self) -> Vec<String> {
        self.groups.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Members of a named group, preserving declared order. Empty for
    /// unknown groups.
    pub fn get_server_group(&self, group_name: &str) -> Vec<String> {
        self.groups
            .iter()
            .find(|(name, _)| name == group_name)
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }

    /// Names still queued for automatic discovery.
    pub fn pending_discovery(&self) -> Vec<String> {
        self.pending_discovery
            .lock()
            .expect("discovery queue lock poisoned")
            .clone()
    }

    /// Re-serializes the catalog in the `mcpServers` map shape.
    ///
    /// Dynamically registered (session-scoped) client credentials are
    /// filtered out, so writing this document to disk keeps the file
    /// free of runtime secrets.
    pub fn to_document(&self) -> Value {
        let mut servers = serde_json::Map::new();

        for name in &self.order {
            let descriptor = &self.servers[name];
            let mut entry = serde_json::Map::new();
            entry.insert(
                "transport".to_string(),
                Value::String(descriptor.transport.as_str().to_string()),
            );
            if let Some(command) = &descriptor.command {
                entry.insert("command".to_string(), Value::String(command.clone()));
            }
            if !descriptor.args.is_empty() {
                entry.insert(
                    "args".to_string(),
                    Value::Array(
                        descriptor
                            .args
                            .iter()
                            .map(|a| Value::String(a.clone()))
                            .collect(),
                    ),
                );
            }
            if !descriptor.env.is_empty() {
                entry.insert(
                    "env".to_string(),
                    Value::Object(
                        descriptor
                            .env
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                            .collect(),
                    ),
                );
            }
            if let Some(url) = &descriptor.url {
                entry.insert("url".to_string(), Value::String(url.clone()));
            }
            entry.insert("timeout".to_string(), Value::from(descriptor.timeout));
            if let Some(description) = &descriptor.description {
                entry.insert(
                    "description".to_string(),
                    Value::String(description.clone()),
                );
            }
            if let Some(auth) = descriptor.auth().to_value() {
                entry.insert("auth".to_string(), auth);
            }

            servers.insert(name.clone(), Value::Object(entry));
        }

        let groups: serde_json::Map<String, Value> = self
            .groups
            .iter()
            .map(|(name, members)| {
                (
                    name.clone(),
                    Value::Array(
                        members
                            .iter()
                            .map(|m| Value::String(m.clone()))
                            .collect(),
                    ),
                )
            })
            .collect();

        serde_json::json!({
            "mcpServers": Value::Object(servers),
            "serverGroups": Value::Object(groups),
        })
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn empty() -> Self {
        Self {
            servers: HashMap::new(),
            order: Vec::new(),
            groups: Vec::new(),
            pending_discovery: Mutex::new(Vec::new()),
        }
    }

    /// Parses one server entry and inserts it into the registry.
    fn insert_entry(&mut self, name: String, entry: &Value) -> Result<()> {
        let transport_str = entry
            .get("transport")
            .and_then(|t| t.as_str())
            .unwrap_or("stdio");
        let transport = TransportKind::parse(transport_str)?;

        let url = entry
            .get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string);

        let auth = match entry.get("auth") {
            Some(block) => AuthDescriptor::from_value(block)?,
            None => {
                // URL-bearing servers without an explicit auth block may
                // still require OAuth; queue them for discovery instead
                // of assuming they are open.
                if url.is_some() && matches!(transport, TransportKind::Http | TransportKind::Sse) {
                    tracing::debug!(server = %name, "queued for automatic OAuth discovery");
                    self.pending_discovery
                        .lock()
                        .expect("discovery queue lock poisoned")
                        .push(name.clone());
                }
                AuthDescriptor::None
            }
        };

        let args = entry
            .get("args")
            .and_then(|a| a.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let env = entry
            .get("env")
            .and_then(|e| e.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let descriptor = ServerDescriptor::new(
            name.clone(),
            transport,
            entry
                .get("command")
                .and_then(|c| c.as_str())
                .map(str::to_string),
            args,
            env,
            url,
            entry
                .get("timeout")
                .and_then(|t| t.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            entry
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
            auth,
        );

        if self.servers.insert(name.clone(), Arc::new(descriptor)).is_none() {
            self.order.push(name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
