//! Registry of configured tool servers.
//!
//! Owns the name-to-connection map behind a read/write lock. Connections are
//! shared as `Arc`s so calls, health probes, and status listings operate on
//! a server without holding the registry lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::gateway::connection::ServerConnection;
use crate::gateway::errors::GatewayError;
use crate::gateway::transport::TransportFactory;
use crate::gateway::types::ServerConfig;

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// All configured servers, keyed by their unique name.
#[derive(Default)]
pub struct ConnectionRegistry {
    servers: RwLock<HashMap<String, Arc<ServerConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server. Names must be unique; registering does not connect.
    pub async fn add(&self, config: ServerConfig) -> Result<Arc<ServerConnection>, GatewayError> {
        if config.name.trim().is_empty() {
            return Err(GatewayError::Config {
                name: config.name.clone(),
                reason: "server name must not be empty".into(),
            });
        }

        let mut servers = self.servers.write().await;
        if servers.contains_key(&config.name) {
            return Err(GatewayError::Config {
                name: config.name.clone(),
                reason: "server name already registered".into(),
            });
        }

        let name = config.name.clone();
        let conn = Arc::new(ServerConnection::new(config));
        servers.insert(name.clone(), Arc::clone(&conn));
        tracing::info!(server = %name, transport = %conn.kind(), "server registered");
        Ok(conn)
    }

    /// Remove a server, disconnecting it first if connected.
    ///
    /// The connection is retired before teardown so a health-monitor retry
    /// racing with removal cannot resurrect it. Removing an unknown name is
    /// a no-op and returns `None`.
    pub async fn remove(&self, name: &str) -> Option<Arc<ServerConnection>> {
        let conn = self.servers.write().await.remove(name)?;
        conn.retire();
        conn.disconnect().await;
        tracing::info!(server = %name, "server removed");
        Some(conn)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers.read().await.get(name).cloned()
    }

    pub async fn require(&self, name: &str) -> Result<Arc<ServerConnection>, GatewayError> {
        self.get(name).await.ok_or_else(|| GatewayError::UnknownServer {
            name: name.to_string(),
        })
    }

    /// All registered servers, ordered by name for stable listings.
    pub async fn list(&self) -> Vec<Arc<ServerConnection>> {
        let mut conns: Vec<_> = self.servers.read().await.values().cloned().collect();
        conns.sort_by(|a, b| a.name().cmp(b.name()));
        conns
    }

    pub async fn count(&self) -> usize {
        self.servers.read().await.len()
    }

    /// Connect every enabled server concurrently. Returns how many came up;
    /// individual failures are logged and left in the failed state for the
    /// health monitor to retry.
    pub async fn connect_all(
        &self,
        factory: Arc<dyn TransportFactory>,
        init_timeout: Duration,
    ) -> usize {
        let mut tasks = Vec::new();
        for conn in self.list().await {
            if !conn.enabled() {
                tracing::info!(server = %conn.name(), "skipping disabled server");
                continue;
            }
            let factory = Arc::clone(&factory);
            tasks.push(tokio::spawn(async move {
                conn.ensure_connected(factory.as_ref(), init_timeout)
                    .await
                    .is_ok()
            }));
        }

        let mut connected = 0;
        for task in tasks {
            if let Ok(true) = task.await {
                connected += 1;
            }
        }
        connected
    }

    /// Disconnect every server concurrently. Used during shutdown.
    pub async fn disconnect_all(&self) {
        let conns = self.list().await;
        futures::future::join_all(conns.iter().map(|conn| conn.disconnect())).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
