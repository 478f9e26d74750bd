//! Transport layer: uniform session establishment over HTTP, stdio, and
//! WebSocket.
//!
//! All three transports share one acquisition contract:
//! - open the transport-level resource (client, child process, socket)
//! - attach the protocol session over it
//! - run the `initialize` handshake
//! - on teardown, close the session before the transport
//!
//! [`open_session`] drives that contract generically. The per-transport
//! modules supply only the open/attach/close primitives, so the partial
//! failure unwind exists in exactly one place.

pub mod http;
pub mod stdio;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::errors::GatewayError;
use crate::gateway::types::{
    error_codes, methods, InitializeResult, JsonRpcResponse, TransportConfig, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version announced in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Client name announced in the initialize handshake.
pub const CLIENT_NAME: &str = "toolgate";

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Per-session monotonic request ID source, starting at 1.
///
/// IDs are session-scoped rather than process-global so each handshake is
/// deterministic: the `initialize` request of any session is always id 1.
#[derive(Debug, Default)]
pub struct RequestIdSource(AtomicU64);

impl RequestIdSource {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// An open transport-level resource: HTTP client, child process, or socket.
///
/// A transport outlives the session it carries; closing it releases the OS
/// resource. `close` must be idempotent and must never fail.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport family this is (used in logs and snapshots).
    fn kind(&self) -> TransportKind;

    /// Construct the protocol session over the already-open transport.
    ///
    /// Wiring only, no I/O; the handshake is driven by [`open_session`].
    fn attach(&mut self) -> Result<Box<dyn Session>, GatewayError>;

    /// Whether the underlying resource is still alive, answered locally.
    ///
    /// Only stdio can tell without a round trip (child process liveness);
    /// network transports report `true` and rely on session-level probes.
    async fn alive(&mut self) -> bool {
        true
    }

    /// Release the transport resource. Idempotent; never fails.
    async fn close(&mut self);

    /// Diagnostic context captured from a failed transport.
    ///
    /// Stdio returns buffered stderr output; network transports have
    /// nothing to add.
    async fn failure_context(&mut self) -> String {
        String::new()
    }
}

/// A live protocol session carried by an open transport.
#[async_trait]
pub trait Session: Send + Sync {
    /// One JSON-RPC request/response round trip.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError>;

    /// Fire-and-forget JSON-RPC notification.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), GatewayError>;

    /// Session-level liveness probe.
    async fn probe(&self) -> Result<(), GatewayError> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Close the protocol session. Idempotent; never fails.
    async fn close(&mut self);
}

/// Opens transports from configuration.
///
/// The default implementation dials real servers; tests substitute scripted
/// fakes to exercise lifecycle behavior without processes or sockets.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        server: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn Transport>, GatewayError>;
}

/// Factory that dials real HTTP, stdio, and WebSocket servers.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        server: &str,
        config: &TransportConfig,
    ) -> Result<Box<dyn Transport>, GatewayError> {
        match config {
            TransportConfig::Http { url, headers } => Ok(Box::new(http::HttpTransport::open(
                server, url, headers,
            )?)),
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Ok(Box::new(stdio::StdioTransport::spawn(
                server,
                command,
                args,
                env,
                cwd.as_deref(),
            )?)),
            TransportConfig::Websocket { url, headers } => Ok(Box::new(
                ws::WsTransport::connect(server, url, headers).await?,
            )),
        }
    }
}

// ─── Session Establishment ───────────────────────────────────────────────────

/// Open a transport and establish a protocol session over it.
///
/// Acquisition is strictly ordered: transport first, then session, then the
/// handshake. On any failure after the transport opened, teardown runs in
/// reverse order (session closed before transport), both handles are
/// dropped, and exactly one wrapped `Protocol` error is returned.
pub async fn open_session(
    factory: &dyn TransportFactory,
    server: &str,
    config: &TransportConfig,
    init_timeout: Duration,
) -> Result<(Box<dyn Transport>, Box<dyn Session>, InitializeResult), GatewayError> {
    let mut transport = factory.open(server, config).await?;

    let mut session = match transport.attach() {
        Ok(session) => session,
        Err(e) => {
            transport.close().await;
            return Err(e.into_protocol(server));
        }
    };

    match tokio::time::timeout(init_timeout, handshake(session.as_ref(), server)).await {
        Ok(Ok(init)) => Ok((transport, session, init)),
        Ok(Err(e)) => {
            let context = transport.failure_context().await;
            session.close().await;
            transport.close().await;
            Err(append_context(e.into_protocol(server), &context))
        }
        Err(_) => {
            let context = transport.failure_context().await;
            session.close().await;
            transport.close().await;
            Err(GatewayError::Protocol {
                server: server.to_string(),
                reason: format!(
                    "initialize timed out after {}s{}",
                    init_timeout.as_secs(),
                    format_context_suffix(&context)
                ),
            })
        }
    }
}

/// The protocol handshake: one `initialize` round trip with a fixed client
/// identification payload.
async fn handshake(session: &dyn Session, server: &str) -> Result<InitializeResult, GatewayError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = session.request(methods::INITIALIZE, Some(params)).await?;
    let result = extract_result(response)?;

    serde_json::from_value(result).map_err(|e| GatewayError::Protocol {
        server: server.to_string(),
        reason: format!("malformed initialize response: {e}"),
    })
}

/// Append captured failure context (stderr) to a handshake error.
fn append_context(err: GatewayError, context: &str) -> GatewayError {
    if context.is_empty() {
        return err;
    }
    match err {
        GatewayError::Protocol { server, reason } => GatewayError::Protocol {
            server,
            reason: format!("{reason}{}", format_context_suffix(context)),
        },
        other => other,
    }
}

/// Format a stderr suffix for error messages (empty string if no context).
fn format_context_suffix(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", context.trim())
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting error responses
/// to `GatewayError::Rpc`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, GatewayError> {
    if let Some(err) = response.error {
        return Err(GatewayError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(GatewayError::Rpc {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Test Fakes ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process fakes for lifecycle, catalog, and routing tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{Session, Transport, TransportFactory};
    use crate::gateway::errors::GatewayError;
    use crate::gateway::types::{
        methods, JsonRpcResponse, ServerConfig, TransportConfig, TransportKind,
    };

    /// What a fake server does when asked to initialize.
    #[derive(Clone)]
    pub(crate) enum InitBehavior {
        Ok,
        RpcError(i32, String),
        /// Transport-level failure mid-handshake.
        Broken(String),
        Hang,
    }

    /// What a fake server does with one `tools/call`.
    #[derive(Clone)]
    pub(crate) enum CallBehavior {
        /// Reply with `{"echo": <params>}`.
        Echo,
        Result(Value),
        RpcError(i32, String),
        /// Transport-level failure mid-call.
        Broken(String),
        Hang,
    }

    /// Scripted behavior for one fake server.
    #[derive(Clone)]
    pub(crate) struct ServerScript {
        pub fail_open: Option<String>,
        pub fail_attach: Option<String>,
        /// Delay before each initialize reply (simulates slow servers).
        pub init_delay: Duration,
        /// Per-attempt initialize behaviors; empty queue means success.
        pub init: Arc<Mutex<VecDeque<InitBehavior>>>,
        /// Tools advertised by `tools/list`: (name, description).
        pub tools: Vec<(String, String)>,
        /// Whether `tools/list` inlines the input schemas.
        pub inline_schemas: bool,
        /// Schemas served by `tools/schema`.
        pub schemas: HashMap<String, Value>,
        /// When false, `tools/schema` answers method-not-found.
        pub has_schema_method: bool,
        /// When set, `tools/list` and `tools/schema` never answer.
        pub hang_discovery: Arc<AtomicBool>,
        /// Per-call behaviors; empty queue means `Echo`.
        pub calls: Arc<Mutex<VecDeque<CallBehavior>>>,
        /// Local liveness as reported by `Transport::alive`.
        pub alive: Arc<AtomicBool>,
        /// When set, `ping` fails at the transport level.
        pub fail_ping: Arc<AtomicBool>,
        pub kind: TransportKind,
    }

    impl Default for ServerScript {
        fn default() -> Self {
            let mut schemas = HashMap::new();
            schemas.insert("echo".to_string(), json!({"type": "object", "properties": {}}));
            Self {
                fail_open: None,
                fail_attach: None,
                init_delay: Duration::ZERO,
                init: Arc::new(Mutex::new(VecDeque::new())),
                tools: vec![("echo".to_string(), "Echo the arguments back".to_string())],
                inline_schemas: false,
                schemas,
                has_schema_method: true,
                hang_discovery: Arc::new(AtomicBool::new(false)),
                calls: Arc::new(Mutex::new(VecDeque::new())),
                alive: Arc::new(AtomicBool::new(true)),
                fail_ping: Arc::new(AtomicBool::new(false)),
                kind: TransportKind::Stdio,
            }
        }
    }

    impl ServerScript {
        pub fn push_init(&self, behavior: InitBehavior) {
            self.init.lock().unwrap().push_back(behavior);
        }

        pub fn push_call(&self, behavior: CallBehavior) {
            self.calls.lock().unwrap().push_back(behavior);
        }
    }

    /// Shared observation log for assertions.
    #[derive(Default)]
    pub(crate) struct Counters {
        pub opens: AtomicUsize,
        /// (server, method) per request/notify.
        pub requests: Mutex<Vec<(String, String)>>,
        /// "session:<name>" / "transport:<name>" per close call.
        pub closes: Mutex<Vec<String>>,
    }

    impl Counters {
        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn requests_for(&self, server: &str, method: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, m)| s == server && m == method)
                .count()
        }

        pub fn closes(&self) -> Vec<String> {
            self.closes.lock().unwrap().clone()
        }
    }

    /// Factory producing scripted fake transports.
    pub(crate) struct ScriptedFactory {
        scripts: Mutex<HashMap<String, ServerScript>>,
        pub counters: Arc<Counters>,
    }

    impl ScriptedFactory {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                counters: Arc::new(Counters::default()),
            }
        }

        pub fn script(&self, server: &str, script: ServerScript) {
            self.scripts.lock().unwrap().insert(server.to_string(), script);
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn open(
            &self,
            server: &str,
            _config: &TransportConfig,
        ) -> Result<Box<dyn Transport>, GatewayError> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(server)
                .cloned()
                .unwrap_or_default();
            self.counters.opens.fetch_add(1, Ordering::SeqCst);

            if let Some(reason) = script.fail_open.clone() {
                return Err(GatewayError::Transport {
                    server: server.to_string(),
                    reason,
                });
            }

            Ok(Box::new(FakeTransport {
                server: server.to_string(),
                script,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    pub(crate) struct FakeTransport {
        server: String,
        script: ServerScript,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.script.kind
        }

        fn attach(&mut self) -> Result<Box<dyn Session>, GatewayError> {
            if let Some(reason) = self.script.fail_attach.clone() {
                return Err(GatewayError::Transport {
                    server: self.server.clone(),
                    reason,
                });
            }
            Ok(Box::new(FakeSession {
                server: self.server.clone(),
                script: self.script.clone(),
                counters: Arc::clone(&self.counters),
            }))
        }

        async fn alive(&mut self) -> bool {
            self.script.alive.load(Ordering::SeqCst)
        }

        async fn close(&mut self) {
            self.counters
                .closes
                .lock()
                .unwrap()
                .push(format!("transport:{}", self.server));
        }
    }

    pub(crate) struct FakeSession {
        server: String,
        script: ServerScript,
        counters: Arc<Counters>,
    }

    impl FakeSession {
        fn record(&self, method: &str) {
            self.counters
                .requests
                .lock()
                .unwrap()
                .push((self.server.clone(), method.to_string()));
        }

        fn broken(&self, reason: &str) -> GatewayError {
            GatewayError::Transport {
                server: self.server.clone(),
                reason: reason.to_string(),
            }
        }
    }

    fn ok_response(result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 0,
            result: Some(result),
            error: None,
        }
    }

    fn error_response(code: i32, message: &str) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 0,
            result: None,
            error: Some(crate::gateway::types::JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> Result<JsonRpcResponse, GatewayError> {
            self.record(method);

            match method {
                methods::INITIALIZE => {
                    if !self.script.init_delay.is_zero() {
                        tokio::time::sleep(self.script.init_delay).await;
                    }
                    let behavior = self
                        .script
                        .init
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or(InitBehavior::Ok);
                    match behavior {
                        InitBehavior::Ok => Ok(ok_response(json!({
                            "serverInfo": {"name": self.server, "version": "0.0-fake"},
                            "capabilities": {},
                        }))),
                        InitBehavior::RpcError(code, message) => {
                            Ok(error_response(code, &message))
                        }
                        InitBehavior::Broken(reason) => Err(self.broken(&reason)),
                        InitBehavior::Hang => {
                            futures::future::pending::<()>().await;
                            unreachable!()
                        }
                    }
                }
                methods::TOOLS_LIST => {
                    if self.script.hang_discovery.load(Ordering::SeqCst) {
                        futures::future::pending::<()>().await;
                    }
                    let tools: Vec<Value> = self
                        .script
                        .tools
                        .iter()
                        .map(|(name, description)| {
                            let mut tool = json!({"name": name, "description": description});
                            if self.script.inline_schemas {
                                if let Some(schema) = self.script.schemas.get(name) {
                                    tool["inputSchema"] = schema.clone();
                                }
                            }
                            tool
                        })
                        .collect();
                    Ok(ok_response(json!({"tools": tools})))
                }
                methods::TOOLS_SCHEMA => {
                    if self.script.hang_discovery.load(Ordering::SeqCst) {
                        futures::future::pending::<()>().await;
                    }
                    if !self.script.has_schema_method {
                        return Ok(error_response(-32601, "method not found: tools/schema"));
                    }
                    let name = params
                        .as_ref()
                        .and_then(|p| p.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    match self.script.schemas.get(&name) {
                        Some(schema) => {
                            let description = self
                                .script
                                .tools
                                .iter()
                                .find(|(n, _)| *n == name)
                                .map(|(_, d)| d.clone())
                                .unwrap_or_default();
                            Ok(ok_response(json!({
                                "name": name,
                                "description": description,
                                "inputSchema": schema,
                            })))
                        }
                        None => Ok(error_response(-32602, "unknown tool")),
                    }
                }
                methods::PING => {
                    if self.script.fail_ping.load(Ordering::SeqCst) {
                        return Err(self.broken("ping failed: connection reset"));
                    }
                    Ok(ok_response(json!({})))
                }
                methods::TOOLS_CALL => {
                    let behavior = self
                        .script
                        .calls
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or(CallBehavior::Echo);
                    match behavior {
                        CallBehavior::Echo => {
                            Ok(ok_response(json!({"echo": params.unwrap_or(Value::Null)})))
                        }
                        CallBehavior::Result(value) => Ok(ok_response(value)),
                        CallBehavior::RpcError(code, message) => {
                            Ok(error_response(code, &message))
                        }
                        CallBehavior::Broken(reason) => Err(self.broken(&reason)),
                        CallBehavior::Hang => {
                            futures::future::pending::<()>().await;
                            unreachable!()
                        }
                    }
                }
                other => Ok(error_response(-32601, &format!("method not found: {other}"))),
            }
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), GatewayError> {
            self.record(&format!("notify:{method}"));
            Ok(())
        }

        async fn close(&mut self) {
            self.counters
                .closes
                .lock()
                .unwrap()
                .push(format!("session:{}", self.server));
        }
    }

    /// Convenience stdio-style config for tests that never dial anything.
    pub(crate) fn placeholder_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: "unused".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            enabled: true,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
