//! HTTP transport: JSON-RPC over request/response POST exchanges.
//!
//! Each request is an independent POST carrying one JSON-RPC object; the
//! response body carries the reply. No connection state is held between
//! calls, so concurrent requests to the same server are fine.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;

use crate::gateway::errors::GatewayError;
use crate::gateway::types::{JsonRpcRequest, JsonRpcResponse, TransportKind};

use super::{RequestIdSource, Session, Transport};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connect timeout for the underlying client.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

// ─── HttpTransport ───────────────────────────────────────────────────────────

/// An HTTP tool server endpoint.
///
/// Holds the configured client until a session attaches; there is no
/// persistent connection to tear down.
pub struct HttpTransport {
    server: String,
    url: Url,
    headers: HeaderMap,
    client: Option<reqwest::Client>,
}

impl HttpTransport {
    /// Validate the endpoint and build the client.
    pub fn open(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let url = Url::parse(url).map_err(|e| GatewayError::Transport {
            server: server.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;

        let mut header_map = HeaderMap::new();
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
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport {
                server: server.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server: server.to_string(),
            url,
            headers: header_map,
            client: Some(client),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn attach(&mut self) -> Result<Box<dyn Session>, GatewayError> {
        let client = self.client.take().ok_or(GatewayError::Transport {
            server: self.server.clone(),
            reason: "HTTP client already taken".into(),
        })?;

        Ok(Box::new(HttpSession {
            server: self.server.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            client,
            ids: RequestIdSource::new(),
        }))
    }

    async fn close(&mut self) {
        // Nothing persistent to tear down
        self.client = None;
    }
}

// ─── HttpSession ─────────────────────────────────────────────────────────────

/// Live JSON-RPC session against an HTTP endpoint.
pub struct HttpSession {
    server: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    ids: RequestIdSource,
}

impl HttpSession {
    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            server: self.server.clone(),
            reason: reason.into(),
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.transport_err("request timed out")
                } else if e.is_connect() {
                    self.transport_err(format!("connection failed: {e}"))
                } else {
                    self.transport_err(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_err(format!("HTTP {status}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = self.ids.next();
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req)
            .map_err(|e| self.transport_err(format!("failed to serialize request: {e}")))?;

        let response = self.post(&body).await?;

        let resp: JsonRpcResponse = response.json().await.map_err(|e| GatewayError::Protocol {
            server: self.server.clone(),
            reason: format!("invalid JSON-RPC response: {e}"),
        })?;

        if resp.id != id {
            return Err(GatewayError::Protocol {
                server: self.server.clone(),
                reason: format!("response id {} does not match request id {id}", resp.id),
            });
        }

        Ok(resp)
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

        self.post(&notification).await?;
        Ok(())
    }

    async fn close(&mut self) {
        // Per-request protocol; dropping the client is enough
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
