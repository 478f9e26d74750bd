//! Gateway error types.

use serde::Serialize;
use thiserror::Error;

use super::types::error_codes;

/// Errors that can occur during gateway operations.
///
/// Variants carry their context as strings so errors stay cloneable; a failed
/// connect attempt is observed by every caller that coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Server configuration rejected at registration or load time.
    #[error("config error for server '{name}': {reason}")]
    Config {
        name: String,
        reason: String,
    },

    /// No server registered under this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// Transport-level failure: open, I/O, or unexpected channel close.
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Session establishment failed after the transport itself opened.
    #[error("session init failed for server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not present in the server's catalog.
    #[error("unknown tool '{tool}' on server '{server}'")]
    ToolNotFound {
        server: String,
        tool: String,
    },
}

impl GatewayError {
    /// Classify a handshake failure as `Protocol`.
    ///
    /// Errors that already carry that classification pass through unchanged,
    /// so retry paths never stack wrappers.
    pub fn into_protocol(self, server: &str) -> GatewayError {
        match self {
            GatewayError::Protocol { .. } => self,
            other => GatewayError::Protocol {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

// ─── Call Errors ─────────────────────────────────────────────────────────────

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// The call did not complete within the configured timeout.
    Timeout,
    /// No live connection could be obtained for the target server.
    NotConnected,
    /// The server answered with an error, or the channel broke mid-call.
    ServerError,
    /// The server rejected the arguments as not matching the tool's schema.
    SchemaMismatch,
    /// The server does not know the requested tool.
    ToolNotFound,
}

/// Typed error carried inside a [`CallResult`](super::types::CallResult).
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
    /// JSON-RPC error code, when the server produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl CallError {
    /// A call that exceeded its deadline.
    pub fn timeout(tool: &str, timeout_ms: u64) -> Self {
        Self {
            kind: CallErrorKind::Timeout,
            message: format!("tool call '{tool}' timed out after {timeout_ms}ms"),
            code: None,
        }
    }

    /// A call that could not reach a live connection.
    pub fn not_connected(reason: impl Into<String>) -> Self {
        Self {
            kind: CallErrorKind::NotConnected,
            message: reason.into(),
            code: None,
        }
    }

    /// Normalize an internal error into the call-error taxonomy.
    ///
    /// JSON-RPC codes map onto dedicated kinds (method-not-found means the
    /// tool is unknown, invalid-params means the arguments missed the
    /// schema); everything else collapses into connectivity or server-side
    /// failure.
    pub fn from_gateway(err: GatewayError) -> Self {
        match err {
            GatewayError::Rpc { code, message, .. } => {
                let kind = match code {
                    error_codes::METHOD_NOT_FOUND => CallErrorKind::ToolNotFound,
                    error_codes::INVALID_PARAMS => CallErrorKind::SchemaMismatch,
                    _ => CallErrorKind::ServerError,
                };
                Self {
                    kind,
                    message,
                    code: Some(code),
                }
            }
            GatewayError::ToolNotFound { .. } => Self {
                kind: CallErrorKind::ToolNotFound,
                message: err.to_string(),
                code: None,
            },
            // Transport and handshake failures mean the server is not
            // reachable right now; config-level failures land here too.
            other => Self {
                kind: CallErrorKind::NotConnected,
                message: other.to_string(),
                code: None,
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
