//! Minimal MCP client over a stdio transport: initialize handshake and
//! `tools/list`. Tool calls are made by the agent runtime, not here.

use crate::transport::{LaunchError, StdioTransport, TransportError};
use serde_json::{json, Value};
use std::time::Duration;

/// Protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Default wait for a single response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors talking to an MCP server.
#[derive(Debug)]
pub enum McpError {
    Launch(LaunchError),
    Transport(TransportError),
    /// The server answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// No response to `method` within the request timeout.
    Timeout { method: String },
    /// A response was missing the fields we need.
    Protocol(String),
}

impl std::fmt::Display for McpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpError::Launch(e) => write!(f, "{e}"),
            McpError::Transport(e) => write!(f, "{e}"),
            McpError::Rpc { code, message } => write!(f, "MCP error {code}: {message}"),
            McpError::Timeout { method } => write!(f, "timed out waiting for {method} response"),
            McpError::Protocol(msg) => write!(f, "MCP protocol error: {msg}"),
        }
    }
}

impl std::error::Error for McpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            McpError::Launch(e) => Some(e),
            McpError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LaunchError> for McpError {
    fn from(e: LaunchError) -> Self {
        McpError::Launch(e)
    }
}

impl From<TransportError> for McpError {
    fn from(e: TransportError) -> Self {
        McpError::Transport(e)
    }
}

/// JSON-RPC client bound to one transport.
pub struct McpClient {
    transport: StdioTransport,
    next_id: u64,
    timeout: Duration,
}

impl McpClient {
    pub fn new(transport: StdioTransport, timeout: Duration) -> Self {
        Self {
            transport,
            next_id: 1,
            timeout,
        }
    }

    /// Hand the transport back so the caller can close it.
    pub fn into_transport(self) -> StdioTransport {
        self.transport
    }

    /// `initialize` then `notifications/initialized`. Returns the server's
    /// advertised name, if any.
    pub async fn initialize(&mut self) -> Result<Option<String>, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.request("initialize", params).await?;
        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(str::to_string);
        tracing::debug!(server = ?server, "MCP initialized");

        self.transport
            .send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        Ok(server)
    }

    /// Names of the tools the server exposes.
    pub async fn list_tools(&mut self) -> Result<Vec<String>, McpError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| McpError::Protocol("tools/list result has no tools array".into()))?;
        Ok(tools
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Send a request and wait for its response, answering server pings in between.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        self.transport
            .send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;

        match tokio::time::timeout(self.timeout, self.wait_for(id)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                method: method.to_string(),
            }),
        }
    }

    async fn wait_for(&mut self, id: u64) -> Result<Value, McpError> {
        loop {
            let message = self.transport.recv().await?;

            if let Some(method) = message.get("method").and_then(Value::as_str) {
                if let Some(request_id) = message.get("id") {
                    self.answer_server_request(request_id.clone(), method).await?;
                } else {
                    tracing::trace!(method, "MCP notification");
                }
                continue;
            }

            if message.get("id").and_then(Value::as_u64) != Some(id) {
                tracing::debug!(?message, "ignoring unmatched MCP response");
                continue;
            }

            if let Some(error) = message.get("error") {
                return Err(McpError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn answer_server_request(&mut self, id: Value, method: &str) -> Result<(), McpError> {
        let reply = match method {
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            "roots/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"roots": []}}),
            other => {
                tracing::debug!(method = other, "unsupported server request");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {other}")}
                })
            }
        };
        self.transport.send(&reply).await?;
        Ok(())
    }
}
