//! Call routing: resolve a (server, tool) pair, execute, normalize errors.
//!
//! Every call returns a [`CallResult`] envelope; transport and protocol
//! failures are mapped to typed call errors and never escape raw. Routing
//! state is keyed per server name, so one server's outage cannot stall
//! calls headed elsewhere.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gateway::catalog::ToolCatalog;
use crate::gateway::errors::CallError;
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::transport::{extract_result, TransportFactory};
use crate::gateway::types::{methods, CallResult};

// ─── CallRouter ──────────────────────────────────────────────────────────────

/// Routes tool calls to live connections.
pub struct CallRouter {
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<ToolCatalog>,
    factory: Arc<dyn TransportFactory>,
    call_timeout: Duration,
    init_timeout: Duration,
}

impl CallRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        catalog: Arc<ToolCatalog>,
        factory: Arc<dyn TransportFactory>,
        call_timeout: Duration,
        init_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            factory,
            call_timeout,
            init_timeout,
        }
    }

    /// Invoke `tool` on `server` with the given arguments.
    ///
    /// A server that is not currently connected gets one lazy connect
    /// attempt before the call fails, so a cold name self-heals on first
    /// use. The returned envelope always carries the call duration.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> CallResult {
        tracing::debug!(server = %server, tool = %tool, "routing tool call");
        let started = Instant::now();
        let outcome = self.dispatch(server, tool, arguments).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                tracing::info!(server = %server, tool = %tool, duration_ms, "tool call completed");
                CallResult::success(server, tool, value, duration_ms)
            }
            Err(error) => {
                tracing::warn!(
                    server = %server,
                    tool = %tool,
                    kind = ?error.kind,
                    error = %error.message,
                    duration_ms,
                    "tool call failed"
                );
                CallResult::failure(server, tool, error, duration_ms)
            }
        }
    }

    async fn dispatch(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, CallError> {
        let Some(conn) = self.registry.get(server).await else {
            return Err(CallError::not_connected(format!(
                "unknown server '{server}'"
            )));
        };

        let newly_connected = conn
            .ensure_connected(self.factory.as_ref(), self.init_timeout)
            .await
            .map_err(CallError::from_gateway)?;
        if newly_connected {
            ToolCatalog::spawn_warm(Arc::clone(&self.catalog), Arc::clone(&conn));
        }

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments,
        });

        let response = match tokio::time::timeout(
            self.call_timeout,
            conn.request(methods::TOOLS_CALL, Some(params)),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(CallError::from_gateway(e)),
            // The call is abandoned; the in-flight request is dropped and
            // the connection state is left alone. If the wire really is
            // dead, the next use notices and reconnects.
            Err(_) => return Err(CallError::timeout(tool, self.call_timeout.as_millis() as u64)),
        };

        extract_result(response).map_err(CallError::from_gateway)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
