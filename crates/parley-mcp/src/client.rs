//! MCP Client implementation

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::{methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::transport::Transport;
use crate::{McpPrompt, McpResource, McpTool, ServerCapabilities, PROTOCOL_VERSION};

/// Default bound on a single request/response round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP Client for connecting to MCP servers
pub struct McpClient<T: Transport> {
    transport: Arc<Mutex<T>>,
    request_id: AtomicI64,
    request_timeout: Duration,
    server_capabilities: Option<ServerCapabilities>,
}

impl<T: Transport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            request_id: AtomicI64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            server_capabilities: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Capabilities announced by the server during `initialize`
    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    /// Initialize the connection
    pub async fn initialize(&mut self, client_info: ClientInfo) -> Result<ServerInfo, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_info.name,
                "version": client_info.version
            }
        });

        let request = JsonRpcRequest::new(self.next_id(), methods::INITIALIZE).with_params(params);
        let result = self.request(request).await?;

        let server_info: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        self.server_capabilities = Some(server_info.capabilities);

        let notification = serde_json::to_value(JsonRpcNotification::new(methods::INITIALIZED))
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        self.transport
            .lock()
            .await
            .send(notification)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        Ok(ServerInfo {
            name: server_info.server_info.name,
            version: server_info.server_info.version,
        })
    }

    /// List available tools
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::TOOLS_LIST);
        let result: ToolsListResult = decode(self.request(request).await?)?;
        Ok(result.tools)
    }

    /// List prompt templates
    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>, McpError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::PROMPTS_LIST);
        let result: PromptsListResult = decode(self.request(request).await?)?;
        Ok(result.prompts)
    }

    /// List resources
    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpError> {
        let request = JsonRpcRequest::new(self.next_id(), methods::RESOURCES_LIST);
        let result: ResourcesListResult = decode(self.request(request).await?)?;
        Ok(result.resources)
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });

        let request = JsonRpcRequest::new(self.next_id(), methods::TOOLS_CALL).with_params(params);
        decode(self.request(request).await?)
    }

    /// Close the underlying transport
    pub async fn close(&self) -> Result<(), McpError> {
        self.transport
            .lock()
            .await
            .close()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    /// Send a request and wait for its result, bounded by the request timeout
    async fn request(&self, request: JsonRpcRequest) -> Result<Value, McpError> {
        let method = request.method.clone();
        let response = tokio::time::timeout(self.request_timeout, self.send_request(request))
            .await
            .map_err(|_| McpError::Timeout(self.request_timeout))??;

        match (response.result, response.error) {
            (_, Some(error)) => Err(McpError::Server(format!(
                "{} failed ({}): {}",
                method, error.code, error.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(McpError::Protocol("Empty response".to_string())),
        }
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let mut transport = self.transport.lock().await;
        let id = request.id.clone();

        let request_value =
            serde_json::to_value(&request).map_err(|e| McpError::Protocol(e.to_string()))?;

        transport
            .send(request_value)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        loop {
            let message = transport
                .receive()
                .await
                .map_err(|e| McpError::Transport(e.to_string()))?
                .ok_or_else(|| McpError::Transport("Connection closed".to_string()))?;

            // Server-initiated traffic interleaves with replies on the same stream
            if let Some(method) = message.get("method").and_then(Value::as_str) {
                match message.get("id") {
                    Some(server_id) => {
                        let reply = server_request_reply(method, server_id.clone());
                        transport
                            .send(reply)
                            .await
                            .map_err(|e| McpError::Transport(e.to_string()))?;
                    }
                    None => debug!(method, "Ignoring MCP server notification"),
                }
                continue;
            }

            let response: JsonRpcResponse =
                serde_json::from_value(message).map_err(|e| McpError::Protocol(e.to_string()))?;
            if response.id.as_ref() == Some(&id) {
                return Ok(response);
            }
            debug!(received = ?response.id, expected = ?id, "Discarding stale MCP response");
        }
    }
}

/// Replies to requests a server sends us: `ping` is acknowledged, everything
/// else is reported as unsupported.
fn server_request_reply(method: &str, id: Value) -> Value {
    if method == "ping" {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("Method not found: {}", method) }
        })
    }
}

fn decode<R: serde::de::DeserializeOwned>(value: Value) -> Result<R, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::Protocol(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, serde::Deserialize)]
struct InitializeResult {
    #[serde(default)]
    capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    server_info: ServerInfoInner,
}

#[derive(Debug, serde::Deserialize)]
struct ServerInfoInner {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, serde::Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, serde::Deserialize)]
struct PromptsListResult {
    #[serde(default)]
    prompts: Vec<McpPrompt>,
}

#[derive(Debug, serde::Deserialize)]
struct ResourcesListResult {
    #[serde(default)]
    resources: Vec<McpResource>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Concatenated text of every `text` content item
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Non-text payloads (images, embedded resources) pass through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// MCP errors
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl McpError {
    /// Whether the connection itself is suspect (as opposed to the server
    /// rejecting a well-formed request).
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport(_) | McpError::Timeout(_))
    }
}
