//! Gateway core: connection lifecycle and tool-call routing.
//!
//! This module handles:
//! - Registering tool servers and tracking their connection state
//! - JSON-RPC 2.0 sessions over stdio, HTTP, and WebSocket transports
//! - Tool discovery with per-connection metadata and schema caching
//! - Tool call routing with timeouts and normalized error envelopes
//! - Background health probing and reconnection with exponential backoff
//!
//! The [`daemon::Gateway`] facade ties the pieces together and is the one
//! type the daemon binary talks to.

pub mod catalog;
pub mod connection;
pub mod daemon;
pub mod errors;
pub mod health;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use daemon::{Gateway, GatewaySettings};
pub use errors::{CallError, CallErrorKind, GatewayError};
pub use registry::ConnectionRegistry;
pub use types::{CallResult, ConnectionState, ServerConfig, ServerSnapshot, TransportConfig};
