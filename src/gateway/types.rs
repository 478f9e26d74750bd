//! Shared types for the gateway.
//!
//! JSON-RPC 2.0 message types, server configuration, and the public
//! result/snapshot structures returned by gateway operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::CallError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC methods spoken between the gateway and tool servers.
pub mod methods {
    /// Session handshake; carries the client identification payload.
    pub const INITIALIZE: &str = "initialize";
    /// Cheap tool metadata listing (names + descriptions).
    pub const TOOLS_LIST: &str = "tools/list";
    /// Full input schema for a single tool.
    pub const TOOLS_SCHEMA: &str = "tools/schema";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Shutdown notification (no response expected).
    pub const SHUTDOWN: &str = "shutdown";
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// Transport family of a configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Stdio,
    Websocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Websocket => write!(f, "websocket"),
        }
    }
}

/// Transport-specific connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// JSON-RPC over HTTP POST.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// JSON-RPC over a child process's stdin/stdout (line-delimited).
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the child process.
        #[serde(default)]
        cwd: Option<String>,
    },
    /// JSON-RPC over WebSocket text frames.
    Websocket {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// The transport family this configuration belongs to.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Websocket { .. } => TransportKind::Websocket,
        }
    }
}

/// A single registered server: unique name plus transport parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    /// Disabled servers stay registered but are never connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_enabled() -> bool {
    true
}

// ─── Protocol Payloads ───────────────────────────────────────────────────────

/// Payload of a successful `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server identification returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Tool entry as it appears on the wire in `tools/list` and `tools/schema`.
///
/// Servers may inline the input schema in the listing; the catalog keeps it
/// so a later schema request needs no extra round trip.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

/// Payload of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Cheap tool metadata: what `list_tools` hands to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

/// Full tool schema: what `get_tool_schema` hands to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

// ─── Gateway Results ─────────────────────────────────────────────────────────

/// Lifecycle state of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of one registered server, as returned by `list_servers`.
///
/// Built from cached state only; producing a snapshot never touches the
/// network.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub enabled: bool,
    /// Number of cataloged tools; zero until the catalog's first listing for
    /// the current connection completes.
    pub tool_count: usize,
    /// Identifier of the current physical connection, if any.
    pub connection_id: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Normalized result of a tool call.
///
/// Callers always receive this envelope; transport failures never escape as
/// raw errors.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub server: String,
    pub tool: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<CallError>,
    pub duration_ms: u64,
}

impl CallResult {
    /// Build a success envelope.
    pub fn success(server: &str, tool: &str, result: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    /// Build a failure envelope.
    pub fn failure(server: &str, tool: &str, error: CallError, duration_ms: u64) -> Self {
        Self {
            server: server.to_string(),
            tool: tool.to_string(),
            success: false,
            result: None,
            error: Some(error),
            duration_ms,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
