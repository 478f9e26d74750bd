//! Child-process transport: line-delimited JSON-RPC over stdio.
//!
//! The gateway spawns the server as a child process and speaks one JSON
//! object per line over its stdin/stdout. Stderr is captured separately and
//! surfaced when session establishment fails.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::gateway::errors::GatewayError;
use crate::gateway::types::{JsonRpcRequest, JsonRpcResponse, TransportKind};

use super::{RequestIdSource, Session, Transport};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful exit before force-killing the child process.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for stderr output when capturing failure context.
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum captured stderr length, to keep error messages readable.
const STDERR_TRUNCATE_LEN: usize = 2000;

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// A spawned tool server child process.
///
/// Owns the process handle for its whole lifetime; the pipes move into the
/// session on attach. Closing waits for graceful exit, then kills.
pub struct StdioTransport {
    server: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl StdioTransport {
    /// Spawn the server process with piped stdio.
    ///
    /// A failed spawn leaves no child behind; the error carries the spawn
    /// reason.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(command);
        cmd.args(args);

        for (key, value) in env {
            cmd.env(key, value);
        }

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Wire stdio for JSON-RPC; stderr is captured for diagnostics
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::Transport {
            server: server.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(GatewayError::Transport {
            server: server.to_string(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(GatewayError::Transport {
            server: server.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = child.stderr.take();

        tracing::debug!(server = %server, pid = ?child.id(), "spawned tool server process");

        Ok(Self {
            server: server.to_string(),
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr,
        })
    }

    /// OS process id of the child, while it is still owned.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn attach(&mut self) -> Result<Box<dyn Session>, GatewayError> {
        let (stdin, stdout) = match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                return Err(GatewayError::Transport {
                    server: self.server.clone(),
                    reason: "stdio pipes already taken".into(),
                })
            }
        };

        Ok(Box::new(StdioSession {
            server: self.server.clone(),
            pipes: Mutex::new(Some(StdioPipes {
                writer: stdin,
                reader: BufReader::new(stdout),
            })),
            ids: RequestIdSource::new(),
        }))
    }

    async fn alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,     // still running
                Ok(Some(_)) => false, // exited
                Err(_) => false,      // error checking, assume dead
            },
            None => false,
        }
    }

    async fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        // The session has already dropped stdin by now, so a well-behaved
        // server sees EOF and exits on its own. Wait, then force-kill.
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(server = %self.server, "graceful exit timed out, killing process");
                let _ = child.kill().await;
            }
        }
    }

    async fn failure_context(&mut self) -> String {
        read_stderr(self.stderr.take()).await
    }
}

/// Read any available stderr output from a failed server process.
///
/// Uses a short timeout to avoid blocking if stderr is empty or the process
/// is still writing. Truncates long output.
async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(STDERR_READ_TIMEOUT, stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > STDERR_TRUNCATE_LEN {
                // keep the cut on a char boundary
                let mut cut = STDERR_TRUNCATE_LEN;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// Both halves of the child's pipe pair, locked as a unit.
struct StdioPipes {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Live JSON-RPC session over a child process's stdin/stdout.
///
/// A single byte stream cannot demultiplex concurrent exchanges, so each
/// request holds the pipe pair for its full round trip and concurrent
/// callers queue.
pub struct StdioSession {
    server: String,
    pipes: Mutex<Option<StdioPipes>>,
    ids: RequestIdSource,
}

impl StdioSession {
    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Session for StdioSession {
    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Writes one line of JSON, then reads lines until one parses as a
    /// response with the matching `id`. Non-JSON lines (server log noise)
    /// and responses to abandoned requests are skipped. The pipe lock is
    /// held across the write and the read so interleaved exchanges cannot
    /// steal each other's replies.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = self.ids.next();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req)
            .map_err(|e| self.transport_err(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed"))?;

        pipes
            .writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_err(format!("failed to write to stdin: {e}")))?;
        pipes
            .writer
            .flush()
            .await
            .map_err(|e| self.transport_err(format!("failed to flush stdin: {e}")))?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_err(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(
                    self.transport_err("server stdout closed (process may have exited)")
                );
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(_) => {
                    // Response to an abandoned (timed out) request; skip
                    continue;
                }
                Err(_) => {
                    // Not a JSON-RPC response; likely server log output
                    continue;
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut json = serde_json::to_string(&notification)
            .map_err(|e| self.transport_err(format!("failed to serialize notification: {e}")))?;
        json.push('\n');

        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed"))?;
        pipes
            .writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_err(format!("failed to write notification: {e}")))?;
        pipes
            .writer
            .flush()
            .await
            .map_err(|e| self.transport_err(format!("failed to flush notification: {e}")))?;

        Ok(())
    }

    /// Liveness for a stdio server is the child process itself, which the
    /// transport's `alive()` already checked before this runs. No protocol
    /// traffic; not every stdio server implements `ping`.
    async fn probe(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping stdin delivers EOF; the transport close reaps the process
        if let Some(pipes) = self.pipes.lock().await.take() {
            drop(pipes);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
