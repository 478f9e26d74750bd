//! WebSocket transport: JSON-RPC over text frames on a persistent socket.
//!
//! One text frame carries one JSON-RPC object in either direction. The
//! session replies to server pings while waiting for responses, and liveness
//! probes ride on WebSocket ping frames instead of JSON-RPC requests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::gateway::errors::GatewayError;
use crate::gateway::types::{JsonRpcRequest, JsonRpcResponse, TransportKind};

use super::{RequestIdSource, Session, Transport};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the WebSocket handshake (TCP connect plus upgrade).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── WsTransport ─────────────────────────────────────────────────────────────

/// A connected WebSocket to a tool server.
pub struct WsTransport {
    server: String,
    stream: Option<WsStream>,
}

impl WsTransport {
    /// Dial the endpoint and complete the WebSocket upgrade.
    pub async fn connect(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let mut request = url.into_client_request().map_err(|e| GatewayError::Transport {
            server: server.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;

        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                GatewayError::Transport {
                    server: server.to_string(),
                    reason: format!("invalid header name '{key}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| GatewayError::Transport {
                server: server.to_string(),
                reason: format!("invalid header value for '{key}': {e}"),
            })?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| GatewayError::Transport {
                server: server.to_string(),
                reason: format!("websocket connect timed out after {}s", CONNECT_TIMEOUT.as_secs()),
            })?
            .map_err(|e| GatewayError::Transport {
                server: server.to_string(),
                reason: format!("websocket connect failed: {e}"),
            })?;

        tracing::debug!(server = %server, "websocket connected");

        Ok(Self {
            server: server.to_string(),
            stream: Some(stream),
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn attach(&mut self) -> Result<Box<dyn Session>, GatewayError> {
        let stream = self.stream.take().ok_or(GatewayError::Transport {
            server: self.server.clone(),
            reason: "websocket stream already taken".into(),
        })?;

        Ok(Box::new(WsSession {
            server: self.server.clone(),
            stream: Mutex::new(Some(stream)),
            ids: RequestIdSource::new(),
        }))
    }

    async fn close(&mut self) {
        // Only reached when no session attached; otherwise the session owns
        // the stream and closes it.
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

// ─── WsSession ───────────────────────────────────────────────────────────────

/// Live JSON-RPC session over a WebSocket.
pub struct WsSession {
    server: String,
    stream: Mutex<Option<WsStream>>,
    ids: RequestIdSource,
}

impl WsSession {
    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Session for WsSession {
    /// Send a request frame and read frames until the matching response.
    ///
    /// Server pings are answered inline; text frames with other ids (stale
    /// replies to abandoned requests) are skipped.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = self.ids.next();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_err(format!("failed to serialize request: {e}")))?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed"))?;

        stream
            .send(Message::Text(json))
            .await
            .map_err(|e| self.transport_err(format!("failed to send frame: {e}")))?;

        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(self.transport_err(format!("websocket error: {e}"))),
                None => return Err(self.transport_err("websocket stream closed")),
            };

            match frame {
                Message::Text(text) => match serde_json::from_str::<JsonRpcResponse>(&text) {
                    Ok(resp) if resp.id == id => return Ok(resp),
                    Ok(_) => continue,  // stale reply to an abandoned request
                    Err(_) => continue, // not a JSON-RPC response
                },
                Message::Ping(payload) => {
                    stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| self.transport_err(format!("failed to send pong: {e}")))?;
                }
                Message::Close(_) => {
                    return Err(self.transport_err("server closed the connection"));
                }
                _ => continue,
            }
        }
    }

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
        let json = serde_json::to_string(&notification)
            .map_err(|e| self.transport_err(format!("failed to serialize notification: {e}")))?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed"))?;

        stream
            .send(Message::Text(json))
            .await
            .map_err(|e| self.transport_err(format!("failed to send frame: {e}")))
    }

    /// Liveness check via a WebSocket ping frame rather than a JSON-RPC
    /// request, so probing never competes with an in-flight call's reply.
    async fn probe(&self) -> Result<(), GatewayError> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("session closed"))?;

        stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| self.transport_err(format!("failed to send ping: {e}")))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.close(None).await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
