//! Health monitoring: periodic liveness probes and reconnection with backoff.
//!
//! On each tick, connected servers get a liveness probe and failed servers
//! move through a capped exponential backoff schedule (base 1s, doubling,
//! capped at 60s, with a ±25% jitter so a fleet of failed servers does not
//! redial in lockstep). At most one reconnect attempt per server per tick.
//! Monitoring failures are logged and never fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::gateway::catalog::ToolCatalog;
use crate::gateway::connection::ServerConnection;
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::transport::TransportFactory;
use crate::gateway::types::ConnectionState;

// ─── Constants ───────────────────────────────────────────────────────────────

/// First reconnect delay after a failure.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

// ─── HealthMonitor ───────────────────────────────────────────────────────────

/// Background watcher over every registered connection.
pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    catalog: Arc<ToolCatalog>,
    factory: Arc<dyn TransportFactory>,
    interval: Duration,
    probe_timeout: Duration,
    init_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        catalog: Arc<ToolCatalog>,
        factory: Arc<dyn TransportFactory>,
        interval: Duration,
        probe_timeout: Duration,
        init_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            catalog,
            factory,
            interval,
            probe_timeout,
            init_timeout,
        }
    }

    /// Run the monitor loop until the returned task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the interval's first tick fires immediately; consume it so
            // probing starts one full interval after startup
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.run_tick().await;
            }
        })
    }

    /// One monitoring pass over all registered servers.
    pub async fn run_tick(&self) {
        for conn in self.registry.list().await {
            if !conn.enabled() || conn.is_retired() {
                continue;
            }
            match conn.state() {
                ConnectionState::Connected => {
                    if let Err(e) = conn.probe(self.probe_timeout).await {
                        tracing::warn!(server = %conn.name(), error = %e, "health probe failed");
                    }
                }
                ConnectionState::Failed => self.drive_retry(conn).await,
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
        }
    }

    /// Advance one failed server through its backoff schedule.
    async fn drive_retry(&self, conn: Arc<ServerConnection>) {
        let (attempts, next_retry) = conn.backoff_state();
        match next_retry {
            None => {
                let delay = backoff_delay(attempts);
                conn.set_next_retry(Instant::now() + delay);
                tracing::debug!(
                    server = %conn.name(),
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
            }
            Some(at) if Instant::now() >= at => {
                tracing::info!(server = %conn.name(), attempts, "attempting reconnect");
                match conn.reconnect(self.factory.as_ref(), self.init_timeout).await {
                    Ok(()) => {
                        tracing::info!(server = %conn.name(), "reconnected");
                        ToolCatalog::spawn_warm(Arc::clone(&self.catalog), conn);
                    }
                    Err(e) => {
                        // the failed attempt bumped the attempt count and
                        // cleared the schedule; next tick backs off further
                        tracing::warn!(server = %conn.name(), error = %e, "reconnect failed");
                    }
                }
            }
            Some(_) => {} // backoff window still open
        }
    }
}

/// Delay before reconnect attempt number `attempts` (1-based): capped
/// exponential with jitter.
fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(6);
    let raw = BACKOFF_BASE.saturating_mul(1u32 << exp);
    apply_jitter(raw.min(BACKOFF_CAP))
}

/// Spread a delay by ±25%, seeded from the clock's sub-second noise.
fn apply_jitter(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let spread_per_mille = (nanos % 501) as i64 - 250;
    let millis = delay.as_millis() as i64;
    let adjusted = millis + millis * spread_per_mille / 1000;
    Duration::from_millis(adjusted.max(0) as u64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
