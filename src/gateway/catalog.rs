//! Tool catalog: per-server cache of tool metadata and input schemas.
//!
//! Progressive disclosure keeps caller context cheap: `tools/list` gives
//! names and one-line descriptions, full input schemas are fetched only when
//! a specific tool's schema is requested, then cached. Cache entries are
//! keyed to the connection generation (epoch) that produced them, so a
//! reconnected server starts with a fresh catalog. Discovery round trips
//! are time-bounded the same way tool calls are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::gateway::connection::ServerConnection;
use crate::gateway::errors::GatewayError;
use crate::gateway::transport::extract_result;
use crate::gateway::types::{
    methods, ConnectionState, JsonRpcResponse, ToolDescriptor, ToolMetadata, ToolSchema,
    ToolsListResult,
};

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

struct CatalogEntry {
    /// Connection generation this entry was fetched under.
    epoch: u64,
    /// Listing order as the server reported it.
    tools: Vec<ToolMetadata>,
    /// Schemas inlined by the listing or fetched on demand.
    schemas: HashMap<String, serde_json::Value>,
}

/// Cached tool metadata and schemas for all registered servers.
pub struct ToolCatalog {
    entries: RwLock<HashMap<String, CatalogEntry>>,
    /// Bound on one discovery round trip (`tools/list` or `tools/schema`).
    fetch_timeout: Duration,
}

impl ToolCatalog {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fetch_timeout,
        }
    }

    /// Lightweight tool metadata for one server.
    ///
    /// Served from cache when present for the current connection generation.
    /// A server that is not connected yields an empty list, not an error;
    /// callers distinguish "no tools yet" from "broken" via `list_servers`.
    pub async fn list_tools(
        &self,
        conn: &ServerConnection,
    ) -> Result<Vec<ToolMetadata>, GatewayError> {
        let epoch = conn.epoch();

        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(conn.name()).filter(|e| e.epoch == epoch) {
                return Ok(entry.tools.clone());
            }
        }

        if conn.state() != ConnectionState::Connected {
            return Ok(Vec::new());
        }

        let entry = self.fetch_listing(conn, epoch).await?;
        let tools = entry.tools.clone();

        let mut entries = self.entries.write().await;
        match entries.get(conn.name()) {
            // a newer connection generation already repopulated; keep it
            Some(existing) if existing.epoch > epoch => {}
            _ => {
                entries.insert(conn.name().to_string(), entry);
            }
        }
        Ok(tools)
    }

    /// Full input schema for one tool, fetched at most once per connection
    /// generation.
    pub async fn get_schema(
        &self,
        conn: &ServerConnection,
        tool: &str,
    ) -> Result<ToolSchema, GatewayError> {
        let epoch = conn.epoch();

        // Metadata first: unknown tool names fail without a schema fetch
        let tools = self.list_tools(conn).await?;
        if tools.is_empty() && conn.state() != ConnectionState::Connected {
            return Err(GatewayError::Transport {
                server: conn.name().to_string(),
                reason: "not connected".into(),
            });
        }
        let meta = tools
            .iter()
            .find(|t| t.name == tool)
            .ok_or_else(|| GatewayError::ToolNotFound {
                server: conn.name().to_string(),
                tool: tool.to_string(),
            })?;

        // Covers both a schema inlined at listing time and an earlier fetch
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(conn.name()).filter(|e| e.epoch == epoch) {
                if let Some(schema) = entry.schemas.get(tool) {
                    return Ok(ToolSchema {
                        name: tool.to_string(),
                        description: meta.description.clone(),
                        input_schema: schema.clone(),
                    });
                }
            }
        }

        let response = self
            .bounded_request(
                conn,
                methods::TOOLS_SCHEMA,
                Some(serde_json::json!({"name": tool})),
            )
            .await?;
        let result = extract_result(response)?;
        let descriptor: ToolDescriptor =
            serde_json::from_value(result).map_err(|e| GatewayError::Protocol {
                server: conn.name().to_string(),
                reason: format!("malformed tools/schema response: {e}"),
            })?;
        let schema = descriptor.input_schema.ok_or_else(|| GatewayError::Protocol {
            server: conn.name().to_string(),
            reason: "tools/schema response missing inputSchema".into(),
        })?;

        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries
                .get_mut(conn.name())
                .filter(|e| e.epoch == epoch)
            {
                entry.schemas.insert(tool.to_string(), schema.clone());
            }
        }

        let description = if descriptor.description.is_empty() {
            meta.description.clone()
        } else {
            descriptor.description
        };
        Ok(ToolSchema {
            name: tool.to_string(),
            description,
            input_schema: schema,
        })
    }

    /// Cached tool count for the given connection generation; zero when the
    /// listing has not completed yet.
    pub async fn tool_count(&self, name: &str, epoch: u64) -> usize {
        self.entries
            .read()
            .await
            .get(name)
            .filter(|e| e.epoch == epoch)
            .map(|e| e.tools.len())
            .unwrap_or(0)
    }

    /// Drop everything cached for a server. Used when the server is removed.
    pub async fn invalidate(&self, name: &str) {
        if self.entries.write().await.remove(name).is_some() {
            tracing::debug!(server = %name, "tool catalog invalidated");
        }
    }

    /// Kick off the initial listing for a freshly connected server without
    /// making the connect caller wait; the caller may observe the server as
    /// connected before its tool list lands.
    pub fn spawn_warm(catalog: Arc<ToolCatalog>, conn: Arc<ServerConnection>) {
        tokio::spawn(async move {
            if let Err(e) = catalog.list_tools(conn.as_ref()).await {
                tracing::debug!(server = %conn.name(), error = %e, "catalog warm-up failed");
            }
        });
    }

    /// One discovery round trip, bounded by `fetch_timeout`.
    ///
    /// On timeout the in-flight request is dropped and the connection state
    /// is left alone, same as an abandoned tool call.
    async fn bounded_request(
        &self,
        conn: &ServerConnection,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        match tokio::time::timeout(self.fetch_timeout, conn.request(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Transport {
                server: conn.name().to_string(),
                reason: format!(
                    "{method} timed out after {}ms",
                    self.fetch_timeout.as_millis()
                ),
            }),
        }
    }

    async fn fetch_listing(
        &self,
        conn: &ServerConnection,
        epoch: u64,
    ) -> Result<CatalogEntry, GatewayError> {
        let response = self.bounded_request(conn, methods::TOOLS_LIST, None).await?;
        let result = extract_result(response)?;
        let listing: ToolsListResult =
            serde_json::from_value(result).map_err(|e| GatewayError::Protocol {
                server: conn.name().to_string(),
                reason: format!("malformed tools/list response: {e}"),
            })?;

        let mut tools = Vec::with_capacity(listing.tools.len());
        let mut schemas = HashMap::new();
        for descriptor in listing.tools {
            if let Some(schema) = descriptor.input_schema {
                schemas.insert(descriptor.name.clone(), schema);
            }
            tools.push(ToolMetadata {
                name: descriptor.name,
                description: descriptor.description,
            });
        }

        tracing::debug!(server = %conn.name(), tools = tools.len(), "tool catalog populated");
        Ok(CatalogEntry {
            epoch,
            tools,
            schemas,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::transport::testing::{placeholder_config, ScriptedFactory, ServerScript};
    use crate::gateway::types::ServerConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const INIT_TIMEOUT: Duration = Duration::from_secs(5);
    const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

    fn connection(name: &str) -> ServerConnection {
        ServerConnection::new(ServerConfig {
            name: name.to_string(),
            transport: placeholder_config(name).transport,
            enabled: true,
        })
    }

    #[tokio::test]
    async fn test_list_tools_empty_when_disconnected() {
        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let conn = connection("alpha");

        let tools = catalog.list_tools(&conn).await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn test_list_tools_fetches_once_then_serves_from_cache() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let first = catalog.list_tools(&conn).await.unwrap();
        let second = catalog.list_tools(&conn).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "echo");
        assert_eq!(first, second);
        assert_eq!(factory.counters.requests_for("alpha", "tools/list"), 1);
    }

    #[tokio::test]
    async fn test_schema_fetched_at_most_once() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let schema = catalog.get_schema(&conn, "echo").await.unwrap();
        assert_eq!(schema.name, "echo");
        assert_eq!(schema.input_schema["type"], "object");

        catalog.get_schema(&conn, "echo").await.unwrap();
        assert_eq!(factory.counters.requests_for("alpha", "tools/schema"), 1);
    }

    #[tokio::test]
    async fn test_schema_inlined_at_listing_needs_no_fetch() {
        let factory = ScriptedFactory::new();
        let script = ServerScript {
            inline_schemas: true,
            ..ServerScript::default()
        };
        factory.script("alpha", script);
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        catalog.list_tools(&conn).await.unwrap();
        let schema = catalog.get_schema(&conn, "echo").await.unwrap();

        assert_eq!(schema.input_schema["type"], "object");
        assert_eq!(factory.counters.requests_for("alpha", "tools/schema"), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_schema_fetch() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let err = catalog.get_schema(&conn, "launch_missiles").await.unwrap_err();

        assert!(matches!(err, GatewayError::ToolNotFound { .. }));
        assert_eq!(factory.counters.requests_for("alpha", "tools/schema"), 0);
    }

    #[tokio::test]
    async fn test_schema_error_when_server_lacks_schema_method() {
        let factory = ScriptedFactory::new();
        let script = ServerScript {
            has_schema_method: false,
            ..ServerScript::default()
        };
        factory.script("alpha", script);
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let err = catalog.get_schema(&conn, "echo").await.unwrap_err();

        match err {
            GatewayError::Rpc { code, .. } => assert_eq!(code, -32601),
            other => panic!("expected Rpc error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_schema_not_connected_is_an_error() {
        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        let conn = connection("alpha");

        let err = catalog.get_schema(&conn, "echo").await.unwrap_err();
        match err {
            GatewayError::Transport { reason, .. } => assert!(reason.contains("not connected")),
            other => panic!("expected Transport error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_invalidates_cached_schema() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        catalog.get_schema(&conn, "echo").await.unwrap();
        assert_eq!(factory.counters.requests_for("alpha", "tools/schema"), 1);

        // server upgraded: connection recreated, schemas may have changed
        conn.disconnect().await;
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        catalog.get_schema(&conn, "echo").await.unwrap();
        assert_eq!(factory.counters.requests_for("alpha", "tools/schema"), 2);
    }

    #[tokio::test]
    async fn test_tool_count_is_zero_until_listing_completes() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        assert_eq!(catalog.tool_count("alpha", conn.epoch()).await, 0);

        catalog.list_tools(&conn).await.unwrap();
        assert_eq!(catalog.tool_count("alpha", conn.epoch()).await, 1);

        // a new connection generation starts uncounted
        conn.disconnect().await;
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();
        assert_eq!(catalog.tool_count("alpha", conn.epoch()).await, 0);
    }

    #[tokio::test]
    async fn test_stalled_listing_fetch_times_out() {
        let factory = ScriptedFactory::new();
        let script = ServerScript {
            hang_discovery: Arc::new(AtomicBool::new(true)),
            ..ServerScript::default()
        };
        factory.script("alpha", script);
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(Duration::from_millis(50));
        let err = catalog.list_tools(&conn).await.unwrap_err();

        match err {
            GatewayError::Transport { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected Transport error, got {other}"),
        }
        // the fetch is abandoned; the connection itself is fine
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stalled_schema_fetch_times_out() {
        let factory = ScriptedFactory::new();
        let hang = Arc::new(AtomicBool::new(false));
        let script = ServerScript {
            hang_discovery: hang.clone(),
            ..ServerScript::default()
        };
        factory.script("alpha", script);
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(Duration::from_millis(50));
        catalog.list_tools(&conn).await.unwrap();

        hang.store(true, Ordering::SeqCst);
        let err = catalog.get_schema(&conn, "echo").await.unwrap_err();
        match err {
            GatewayError::Transport { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected Transport error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalidate_drops_the_entry() {
        let factory = ScriptedFactory::new();
        factory.script("alpha", ServerScript::default());
        let conn = connection("alpha");
        conn.ensure_connected(&factory, INIT_TIMEOUT).await.unwrap();

        let catalog = ToolCatalog::new(FETCH_TIMEOUT);
        catalog.list_tools(&conn).await.unwrap();
        catalog.invalidate("alpha").await;

        assert_eq!(catalog.tool_count("alpha", conn.epoch()).await, 0);
        catalog.list_tools(&conn).await.unwrap();
        assert_eq!(factory.counters.requests_for("alpha", "tools/list"), 2);
    }
}
