//! The gateway facade: server management, tool discovery, and call routing
//! behind one handle.
//!
//! Composition root for the core: owns the registry, catalog, router, and
//! transport factory, and exposes the six operations the daemon's outer
//! request layer consumes:
//! - `add_server` / `remove_server` / `list_servers`
//! - `list_tools` / `get_tool_schema`
//! - `call_tool`

use std::sync::Arc;
use std::time::Duration;

use crate::gateway::catalog::ToolCatalog;
use crate::gateway::errors::GatewayError;
use crate::gateway::health::HealthMonitor;
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::router::CallRouter;
use crate::gateway::transport::{DefaultTransportFactory, TransportFactory};
use crate::gateway::types::{
    CallResult, ConnectionState, ServerConfig, ServerSnapshot, ToolMetadata, ToolSchema,
};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Tunable timeouts and intervals.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Bound on transport open plus session handshake.
    pub init_timeout: Duration,
    /// Bound on one tool call or tool discovery round trip.
    pub call_timeout: Duration,
    /// How often the health monitor wakes up.
    pub health_interval: Duration,
    /// Bound on one liveness probe.
    pub probe_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// The connection-lifecycle manager and tool-call router.
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<ToolCatalog>,
    router: CallRouter,
    factory: Arc<dyn TransportFactory>,
    settings: GatewaySettings,
}

impl Gateway {
    /// Gateway over real transports with default settings.
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory), GatewaySettings::default())
    }

    /// Gateway over a caller-supplied transport factory. Tests substitute
    /// scripted fakes here.
    pub fn with_factory(factory: Arc<dyn TransportFactory>, settings: GatewaySettings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let catalog = Arc::new(ToolCatalog::new(settings.call_timeout));
        let router = CallRouter::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&factory),
            settings.call_timeout,
            settings.init_timeout,
        );
        Self {
            registry,
            catalog,
            router,
            factory,
            settings,
        }
    }

    // ─── Server management ───────────────────────────────────────────────────

    /// Register a server. Validation failures never reach connection logic.
    pub async fn add_server(&self, config: ServerConfig) -> Result<(), GatewayError> {
        crate::config::validate_server(&config)?;
        self.registry.add(config).await?;
        Ok(())
    }

    /// Remove a server, disconnecting it and dropping its cached tools.
    /// Removing an unknown name is a quiet no-op.
    pub async fn remove_server(&self, name: &str) -> Result<(), GatewayError> {
        if self.registry.remove(name).await.is_some() {
            self.catalog.invalidate(name).await;
        }
        Ok(())
    }

    /// Status snapshot of every registered server, ordered by name.
    pub async fn list_servers(&self) -> Vec<ServerSnapshot> {
        let mut snapshots = Vec::new();
        for conn in self.registry.list().await {
            let tool_count = self.catalog.tool_count(conn.name(), conn.epoch()).await;
            snapshots.push(conn.snapshot(tool_count));
        }
        snapshots
    }

    // ─── Tool discovery ──────────────────────────────────────────────────────

    /// Lightweight tool metadata for one server; empty if not connected.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolMetadata>, GatewayError> {
        let conn = self.registry.require(server).await?;
        self.catalog.list_tools(conn.as_ref()).await
    }

    /// Full input schema for one tool, fetched on first request and cached.
    pub async fn get_tool_schema(
        &self,
        server: &str,
        tool: &str,
    ) -> Result<ToolSchema, GatewayError> {
        let conn = self.registry.require(server).await?;
        self.catalog.get_schema(conn.as_ref(), tool).await
    }

    // ─── Calls ───────────────────────────────────────────────────────────────

    /// Invoke a tool. Always returns an envelope, never a raw error.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> CallResult {
        self.router.call_tool(server, tool, arguments).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Connect every enabled server and warm the tool catalog in the
    /// background. Returns how many servers came up.
    pub async fn connect_all(&self) -> usize {
        let total = self.registry.count().await;
        let connected = self
            .registry
            .connect_all(Arc::clone(&self.factory), self.settings.init_timeout)
            .await;
        tracing::info!(connected, total, "startup connect finished");

        for conn in self.registry.list().await {
            if conn.state() == ConnectionState::Connected {
                ToolCatalog::spawn_warm(Arc::clone(&self.catalog), conn);
            }
        }
        connected
    }

    /// Start background health monitoring. Abort the returned handle to
    /// stop it.
    pub fn start_health_monitor(&self) -> tokio::task::JoinHandle<()> {
        HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.catalog),
            Arc::clone(&self.factory),
            self.settings.health_interval,
            self.settings.probe_timeout,
            self.settings.init_timeout,
        )
        .spawn()
    }

    /// Disconnect every server gracefully.
    pub async fn shutdown(&self) {
        self.registry.disconnect_all().await;
        tracing::info!("gateway shut down");
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::errors::CallErrorKind;
    use crate::gateway::transport::testing::{placeholder_config, ScriptedFactory, ServerScript};

    fn gateway_with(factory: Arc<ScriptedFactory>) -> Gateway {
        Gateway::with_factory(factory as Arc<dyn TransportFactory>, GatewaySettings::default())
    }

    #[tokio::test]
    async fn test_add_list_remove_servers() {
        let factory = Arc::new(ScriptedFactory::new());
        let gateway = gateway_with(factory);

        gateway.add_server(placeholder_config("bravo")).await.unwrap();
        gateway.add_server(placeholder_config("alpha")).await.unwrap();

        let servers = gateway.list_servers().await;
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "alpha");
        assert_eq!(servers[1].name, "bravo");
        assert_eq!(servers[0].state, ConnectionState::Disconnected);
        assert_eq!(servers[0].tool_count, 0);

        gateway.remove_server("alpha").await.unwrap();
        assert_eq!(gateway.list_servers().await.len(), 1);

        // removing an unknown name still acks
        gateway.remove_server("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_add_server_validates_config() {
        let factory = Arc::new(ScriptedFactory::new());
        let gateway = gateway_with(factory);

        let bad = ServerConfig {
            name: "web".into(),
            transport: crate::gateway::types::TransportConfig::Http {
                url: "ftp://example.com".into(),
                headers: Default::default(),
            },
            enabled: true,
        };
        let err = gateway.add_server(bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
        assert!(gateway.list_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_all_then_discovery_ops() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script("alpha", ServerScript::default());
        let gateway = gateway_with(Arc::clone(&factory));

        gateway.add_server(placeholder_config("alpha")).await.unwrap();
        assert_eq!(gateway.connect_all().await, 1);

        // catalog warm-up is fire-and-forget
        tokio::time::sleep(Duration::from_millis(50)).await;

        let servers = gateway.list_servers().await;
        assert_eq!(servers[0].state, ConnectionState::Connected);
        assert_eq!(servers[0].tool_count, 1);
        assert!(servers[0].connection_id.is_some());

        let tools = gateway.list_tools("alpha").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let schema = gateway.get_tool_schema("alpha", "echo").await.unwrap();
        assert_eq!(schema.input_schema["type"], "object");

        let err = gateway.get_tool_schema("alpha", "nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));

        let err = gateway.list_tools("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownServer { .. }));
    }

    #[tokio::test]
    async fn test_call_tool_end_to_end() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script("alpha", ServerScript::default());
        let gateway = gateway_with(Arc::clone(&factory));

        gateway.add_server(placeholder_config("alpha")).await.unwrap();

        // cold call: lazy connect, then the call itself
        let result = gateway
            .call_tool("alpha", "echo", serde_json::json!({"text": "hi"}))
            .await;
        assert!(result.success);
        assert_eq!(result.result.unwrap()["echo"]["arguments"]["text"], "hi");
        assert_eq!(factory.counters.opens(), 1);
    }

    #[tokio::test]
    async fn test_call_tool_unknown_server_is_an_envelope() {
        let factory = Arc::new(ScriptedFactory::new());
        let gateway = gateway_with(factory);

        let result = gateway.call_tool("ghost", "echo", serde_json::json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, CallErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_remove_server_frees_the_name_and_invalidates_tools() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script("alpha", ServerScript::default());
        let gateway = gateway_with(Arc::clone(&factory));

        gateway.add_server(placeholder_config("alpha")).await.unwrap();
        gateway.connect_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.list_servers().await[0].tool_count, 1);

        gateway.remove_server("alpha").await.unwrap();
        assert!(factory.counters.closes().contains(&"session:alpha".to_string()));

        // the name can be reused immediately
        gateway.add_server(placeholder_config("alpha")).await.unwrap();
        let servers = gateway.list_servers().await;
        assert_eq!(servers[0].state, ConnectionState::Disconnected);
        assert_eq!(servers[0].tool_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_all_servers() {
        let factory = Arc::new(ScriptedFactory::new());
        factory.script("alpha", ServerScript::default());
        factory.script("bravo", ServerScript::default());
        let gateway = gateway_with(Arc::clone(&factory));

        gateway.add_server(placeholder_config("alpha")).await.unwrap();
        gateway.add_server(placeholder_config("bravo")).await.unwrap();
        gateway.connect_all().await;

        gateway.shutdown().await;

        for snapshot in gateway.list_servers().await {
            assert_eq!(snapshot.state, ConnectionState::Disconnected);
        }
        assert_eq!(factory.counters.requests_for("alpha", "notify:shutdown"), 1);
        assert_eq!(factory.counters.requests_for("bravo", "notify:shutdown"), 1);
    }
}
