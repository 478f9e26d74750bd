//! Per-server connection state machine.
//!
//! Each configured server owns one `ServerConnection`, which tracks:
//! - **Status**: the observable state (disconnected, connecting, connected,
//!   failed) plus timestamps and the last error, readable without blocking
//!   on any I/O.
//! - **Live half**: the open transport and session, once connected.
//! - **Lifecycle lock**: connects, reconnects and disconnects for one server
//!   are mutually exclusive; concurrent connect callers coalesce onto a
//!   single attempt and all observe its outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::gateway::errors::GatewayError;
use crate::gateway::transport::{open_session, Session, Transport, TransportFactory};
use crate::gateway::types::{
    methods, ConnectionState, JsonRpcResponse, ServerConfig, ServerSnapshot, TransportKind,
};

// ─── ServerConnection ────────────────────────────────────────────────────────

/// The open transport and session for a connected server.
struct Live {
    transport: Box<dyn Transport>,
    session: Box<dyn Session>,
}

/// Mutable status fields, guarded by a plain mutex so snapshots never wait
/// on connection I/O.
struct StatusInner {
    state: ConnectionState,
    connection_id: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Outcome of the most recent connect attempt, kept so callers that
    /// coalesced onto it can observe the same error.
    last_connect_error: Option<GatewayError>,
    /// Bumped once per finished connect attempt (success or failure).
    attempt_serial: u64,
    reconnect_attempts: u32,
    next_retry_at: Option<Instant>,
}

/// One configured tool server and its connection lifecycle.
pub struct ServerConnection {
    name: String,
    config: ServerConfig,
    /// Serializes connect/reconnect/disconnect for this server.
    lifecycle: tokio::sync::Mutex<()>,
    live: RwLock<Option<Live>>,
    status: StdMutex<StatusInner>,
    /// Bumped on every successful connect; cached tool data from an earlier
    /// connection generation is stale.
    epoch: AtomicU64,
    /// Set when the server is removed from the registry; blocks any further
    /// connect attempts racing with removal.
    retired: AtomicBool,
}

impl ServerConnection {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            live: RwLock::new(None),
            status: StdMutex::new(StatusInner {
                state: ConnectionState::Disconnected,
                connection_id: None,
                connected_at: None,
                last_activity: None,
                last_error: None,
                last_connect_error: None,
                attempt_serial: 0,
                reconnect_attempts: 0,
                next_retry_at: None,
            }),
            epoch: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.config.transport.kind()
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Connection generation; changes whenever a new session is established.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_status().state
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Mark this server as removed; in-flight and future connect attempts
    /// bail out instead of resurrecting it.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn lock_status(&self) -> MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Connecting ──────────────────────────────────────────────────────────

    /// Make sure a live session exists, connecting if necessary.
    ///
    /// Returns `true` when this call established a new session, `false`
    /// when one already existed. Callers that arrive while an attempt is
    /// already running wait for it and adopt its outcome rather than
    /// starting a second attempt.
    pub async fn ensure_connected(
        &self,
        factory: &dyn TransportFactory,
        init_timeout: Duration,
    ) -> Result<bool, GatewayError> {
        let observed_serial = {
            let status = self.lock_status();
            if status.state == ConnectionState::Connected {
                return Ok(false);
            }
            status.attempt_serial
        };

        let _guard = self.lifecycle.lock().await;

        if self.is_retired() {
            return Err(GatewayError::UnknownServer {
                name: self.name.clone(),
            });
        }

        // An attempt may have finished while we waited for the lock; adopt
        // its outcome instead of dialing again.
        {
            let status = self.lock_status();
            if status.state == ConnectionState::Connected {
                return Ok(false);
            }
            if status.attempt_serial > observed_serial {
                return Err(status.last_connect_error.clone().unwrap_or_else(|| {
                    GatewayError::Transport {
                        server: self.name.clone(),
                        reason: "connect attempt failed".into(),
                    }
                }));
            }
        }

        self.connect_locked(factory, init_timeout).await.map(|_| true)
    }

    /// Reconnect a failed server. Used by the health monitor's retry path.
    pub async fn reconnect(
        &self,
        factory: &dyn TransportFactory,
        init_timeout: Duration,
    ) -> Result<(), GatewayError> {
        let _guard = self.lifecycle.lock().await;

        if self.is_retired() {
            return Err(GatewayError::UnknownServer {
                name: self.name.clone(),
            });
        }
        if self.lock_status().state == ConnectionState::Connected {
            return Ok(());
        }

        self.connect_locked(factory, init_timeout).await
    }

    /// The single connect path. Caller must hold the lifecycle lock.
    async fn connect_locked(
        &self,
        factory: &dyn TransportFactory,
        init_timeout: Duration,
    ) -> Result<(), GatewayError> {
        // Drop any dead session left over from a previous generation
        self.teardown_live().await;

        {
            let mut status = self.lock_status();
            status.state = ConnectionState::Connecting;
        }
        tracing::info!(server = %self.name, transport = %self.kind(), "connecting");

        match open_session(factory, &self.name, &self.config.transport, init_timeout).await {
            Ok((transport, session, init)) => {
                let connection_id = Uuid::new_v4().to_string();
                *self.live.write().await = Some(Live { transport, session });
                self.epoch.fetch_add(1, Ordering::SeqCst);

                let mut status = self.lock_status();
                let now = Utc::now();
                status.state = ConnectionState::Connected;
                status.connection_id = Some(connection_id.clone());
                status.connected_at = Some(now);
                status.last_activity = Some(now);
                status.last_error = None;
                status.last_connect_error = None;
                status.attempt_serial += 1;
                status.reconnect_attempts = 0;
                status.next_retry_at = None;
                drop(status);

                let info = init.server_info.as_ref();
                tracing::info!(
                    server = %self.name,
                    connection_id = %connection_id,
                    server_name = ?info.and_then(|s| s.name.as_deref()),
                    server_version = ?info.and_then(|s| s.version.as_deref()),
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                let mut status = self.lock_status();
                status.state = ConnectionState::Failed;
                status.last_error = Some(e.to_string());
                status.last_connect_error = Some(e.clone());
                status.attempt_serial += 1;
                status.reconnect_attempts = status.reconnect_attempts.saturating_add(1);
                status.next_retry_at = None;
                drop(status);

                tracing::warn!(server = %self.name, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    // ─── Disconnecting ───────────────────────────────────────────────────────

    /// Gracefully disconnect: best-effort shutdown notification, then close
    /// the session and transport in order.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown_live().await;

        let mut status = self.lock_status();
        status.state = ConnectionState::Disconnected;
        status.connection_id = None;
        status.connected_at = None;
        status.last_error = None;
        status.last_connect_error = None;
        status.reconnect_attempts = 0;
        status.next_retry_at = None;
        drop(status);

        tracing::info!(server = %self.name, "disconnected");
    }

    async fn teardown_live(&self) {
        if let Some(mut live) = self.live.write().await.take() {
            let _ = live.session.notify(methods::SHUTDOWN, None).await;
            live.session.close().await;
            live.transport.close().await;
        }
    }

    // ─── Request path ────────────────────────────────────────────────────────

    /// Send a request over the live session.
    ///
    /// Concurrent callers share the session; a send failure flips the
    /// connection to failed so the next call reconnects.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let live = self.live.read().await;
        let Some(live) = live.as_ref() else {
            return Err(GatewayError::Transport {
                server: self.name.clone(),
                reason: "not connected".into(),
            });
        };

        let result = live.session.request(method, params).await;
        match &result {
            Ok(_) => self.touch(),
            Err(e) => self.note_send_failure(e),
        }
        result
    }

    fn touch(&self) {
        self.lock_status().last_activity = Some(Utc::now());
    }

    /// Record a wire failure observed mid-use. Only a connected server
    /// transitions; a deliberate disconnect racing with a call stays
    /// disconnected.
    fn note_send_failure(&self, err: &GatewayError) {
        let mut status = self.lock_status();
        if status.state == ConnectionState::Connected {
            status.state = ConnectionState::Failed;
            status.last_error = Some(err.to_string());
            tracing::warn!(server = %self.name, error = %err, "connection marked failed");
        }
    }

    // ─── Health ──────────────────────────────────────────────────────────────

    /// Liveness check for the health monitor.
    ///
    /// If a call is in flight the session is demonstrably in use, so the
    /// probe reports healthy without queueing behind it. An idle session
    /// gets a local transport check (catches an exited child process
    /// without a round trip) and then a real probe, bounded by
    /// `probe_timeout`.
    pub async fn probe(&self, probe_timeout: Duration) -> Result<(), GatewayError> {
        let mut guard = match self.live.try_write() {
            Err(_) => return Ok(()),
            Ok(guard) => guard,
        };
        let Some(live) = guard.as_mut() else {
            return Err(GatewayError::Transport {
                server: self.name.clone(),
                reason: "not connected".into(),
            });
        };

        if !live.transport.alive().await {
            drop(guard);
            let err = GatewayError::Transport {
                server: self.name.clone(),
                reason: "transport is no longer alive".into(),
            };
            self.note_send_failure(&err);
            return Err(err);
        }

        match tokio::time::timeout(probe_timeout, live.session.probe()).await {
            Ok(Ok(())) => {
                drop(guard);
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                drop(guard);
                self.note_send_failure(&e);
                Err(e)
            }
            Err(_) => {
                drop(guard);
                let err = GatewayError::Transport {
                    server: self.name.clone(),
                    reason: format!("health probe timed out after {}ms", probe_timeout.as_millis()),
                };
                self.note_send_failure(&err);
                Err(err)
            }
        }
    }

    /// Retry bookkeeping for the health monitor's backoff schedule.
    pub fn backoff_state(&self) -> (u32, Option<Instant>) {
        let status = self.lock_status();
        (status.reconnect_attempts, status.next_retry_at)
    }

    pub fn set_next_retry(&self, at: Instant) {
        self.lock_status().next_retry_at = Some(at);
    }

    // ─── Snapshot ────────────────────────────────────────────────────────────

    /// Point-in-time view of this server for status listings. Never touches
    /// the live session.
    pub fn snapshot(&self, tool_count: usize) -> ServerSnapshot {
        let status = self.lock_status();
        ServerSnapshot {
            name: self.name.clone(),
            transport: self.kind(),
            state: status.state,
            enabled: self.config.enabled,
            tool_count,
            connection_id: status.connection_id.clone(),
            connected_at: status.connected_at,
            last_activity: status.last_activity,
            last_error: status.last_error.clone(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
