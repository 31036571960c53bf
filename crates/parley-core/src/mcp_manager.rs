//! MCP (Model Context Protocol) Connection Manager
//!
//! Owns the live connections to every tool server in the registry. The
//! connection set is built once per registry revision and then reused across
//! chat turns: reads clone an `Arc` out of the current snapshot, rebuilds and
//! relinks swap in a new snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use parley_mcp::{
    CallToolResult, ClientInfo, HttpTransport, McpClient, McpError, McpPrompt, McpResource, McpTool,
    StdioTransport, Transport,
};

use crate::config::McpConfig;
use crate::error::{Error, Result};
use crate::registry::{ServerSpec, ToolServerRegistry, TransportKind};

/// A live connection to one tool server
#[async_trait]
pub trait ToolServerHandle: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;
    async fn list_prompts(&self) -> Result<Vec<McpPrompt>>;
    async fn list_resources(&self) -> Result<Vec<McpResource>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: Transport + 'static> ToolServerHandle for McpClient<T> {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(McpClient::list_tools(self).await?)
    }

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        Ok(McpClient::list_prompts(self).await?)
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        Ok(McpClient::list_resources(self).await?)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        Ok(McpClient::call_tool(self, name, arguments).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(McpClient::close(self).await?)
    }
}

/// Turns a registry entry into a live handle
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, id: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServerHandle>>;
}

/// Connects over stdio or streamable HTTP and performs the MCP handshake
pub struct McpConnector {
    client_name: String,
    request_timeout: Duration,
}

impl McpConnector {
    pub fn new(client_name: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &McpConfig) -> Self {
        Self::new(config.client_name.clone(), config.request_timeout())
    }

    async fn handshake<T: Transport + 'static>(
        &self,
        id: &str,
        transport: T,
    ) -> Result<Arc<dyn ToolServerHandle>> {
        let mut client = McpClient::new(transport).with_request_timeout(self.request_timeout);
        let client_info = ClientInfo {
            name: self.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        match client.initialize(client_info).await {
            Ok(server) => {
                info!(server = %id, name = %server.name, version = %server.version, "Connected to tool server");
                Ok(Arc::new(client))
            }
            Err(e) => {
                let _ = client.close().await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn connect(&self, id: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServerHandle>> {
        match spec.transport_kind() {
            Some(TransportKind::Process) => {
                let command = spec.command.as_deref().unwrap_or_default();
                let transport = StdioTransport::spawn(command, &spec.args, &spec.env)
                    .await
                    .map_err(|e| McpError::Transport(format!("Failed to start '{}': {}", command, e)))?;
                self.handshake(id, transport).await
            }
            Some(TransportKind::Network) => {
                let url = spec.url.as_deref().unwrap_or_default();
                let transport = HttpTransport::new(url, &spec.headers)
                    .map_err(|e| McpError::Transport(format!("Failed to reach '{}': {}", url, e)))?;
                self.handshake(id, transport).await
            }
            None => Err(Error::Config(format!(
                "Tool server '{}' has neither a command nor a url",
                id
            ))),
        }
    }
}

/// One registry entry after a connection attempt
#[derive(Clone)]
pub struct ToolServerConnection {
    pub id: String,
    pub tools: Vec<McpTool>,
    pub prompts: Vec<McpPrompt>,
    pub resources: Vec<McpResource>,
    pub connected: bool,
    /// Why the connection attempt failed
    pub error: Option<String>,
    handle: Option<Arc<dyn ToolServerHandle>>,
}

impl ToolServerConnection {
    fn connected(id: &str, handle: Arc<dyn ToolServerHandle>) -> Self {
        Self {
            id: id.to_string(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            connected: true,
            error: None,
            handle: Some(handle),
        }
    }

    fn failed(id: &str, error: &Error) -> Self {
        Self {
            id: id.to_string(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            connected: false,
            error: Some(error.to_string()),
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&Arc<dyn ToolServerHandle>> {
        self.handle.as_ref()
    }

    /// Descriptive view, safe to hand to a UI
    pub fn info(&self) -> ToolServerInfo {
        ToolServerInfo {
            id: self.id.clone(),
            tools: self.tools.clone(),
            prompts: self.prompts.clone(),
            resources: self.resources.clone(),
            connected: self.connected,
            error_message: self.error.clone(),
        }
    }
}

impl fmt::Debug for ToolServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("id", &self.id)
            .field("tools", &self.tools.len())
            .field("prompts", &self.prompts.len())
            .field("resources", &self.resources.len())
            .field("connected", &self.connected)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Connection metadata without the live handle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerInfo {
    pub id: String,
    pub tools: Vec<McpTool>,
    pub prompts: Vec<McpPrompt>,
    pub resources: Vec<McpResource>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

struct Snapshot {
    revision: u64,
    connections: Arc<[ToolServerConnection]>,
}

/// Process-wide cache of tool server connections
pub struct ConnectionManager {
    registry: Arc<ToolServerRegistry>,
    connector: Arc<dyn Connector>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    rebuild: tokio::sync::Mutex<()>,
    reconnect: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<ToolServerRegistry>, connector: Arc<dyn Connector>) -> Self {
        Self {
            registry,
            connector,
            snapshot: RwLock::new(None),
            rebuild: tokio::sync::Mutex::new(()),
            reconnect: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    /// Every registry entry with its connection state. Served from cache
    /// unless the registry changed or the cache is empty.
    pub async fn load_all(&self) -> Arc<[ToolServerConnection]> {
        if let Some(connections) = self.cached() {
            return connections;
        }

        let _rebuild = self.rebuild.lock().await;
        if let Some(connections) = self.cached() {
            return connections;
        }

        let revision = self.registry.revision();
        let document = self.registry.get();
        debug!(revision, servers = document.servers.len(), "Rebuilding tool server connections");

        let connections: Vec<ToolServerConnection> = join_all(
            document
                .servers
                .iter()
                .map(|(id, spec)| self.establish(id, spec)),
        )
        .await;
        let connections: Arc<[ToolServerConnection]> = connections.into();

        let previous = self.snapshot.write().replace(Arc::new(Snapshot {
            revision,
            connections: connections.clone(),
        }));
        if let Some(previous) = previous {
            close_handles(&previous.connections).await;
        }

        connections
    }

    fn cached(&self) -> Option<Arc<[ToolServerConnection]>> {
        let revision = self.registry.revision();
        self.snapshot
            .read()
            .as_ref()
            .filter(|snapshot| snapshot.revision == revision && !snapshot.connections.is_empty())
            .map(|snapshot| snapshot.connections.clone())
    }

    async fn establish(&self, id: &str, spec: &ServerSpec) -> ToolServerConnection {
        let handle = match self.load_one(id, spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(server = %id, error = %e, "Failed to connect to tool server");
                return ToolServerConnection::failed(id, &e);
            }
        };

        let (tools, prompts, resources) =
            tokio::join!(handle.list_tools(), handle.list_prompts(), handle.list_resources());

        let mut connection = ToolServerConnection::connected(id, handle);
        connection.tools = or_empty(id, "tools", tools);
        connection.prompts = or_empty(id, "prompts", prompts);
        connection.resources = or_empty(id, "resources", resources);
        connection
    }

    /// Connect a single server without touching the cache
    pub async fn load_one(&self, id: &str, spec: &ServerSpec) -> Result<Arc<dyn ToolServerHandle>> {
        self.connector.connect(id, spec).await
    }

    /// Swap the handle cached for `id`, closing the one it replaces.
    /// Returns false when `id` is not in the current snapshot.
    pub async fn relink(&self, id: &str, handle: Arc<dyn ToolServerHandle>) -> bool {
        let replaced = {
            let mut guard = self.snapshot.write();
            let Some(current) = guard.as_ref() else {
                return false;
            };
            let revision = current.revision;
            let mut connections = current.connections.to_vec();
            let Some(entry) = connections.iter_mut().find(|c| c.id == id) else {
                return false;
            };
            let replaced = entry.handle.replace(handle);
            entry.connected = true;
            entry.error = None;
            *guard = Some(Arc::new(Snapshot {
                revision,
                connections: connections.into(),
            }));
            replaced
        };

        if let Some(old) = replaced {
            if let Err(e) = old.close().await {
                debug!(server = %id, error = %e, "Error closing replaced tool server handle");
            }
        }
        true
    }

    /// Cached entry for `id`, if the current snapshot has one
    pub fn connection(&self, id: &str) -> Option<ToolServerConnection> {
        self.snapshot
            .read()
            .as_ref()
            .and_then(|snapshot| snapshot.connections.iter().find(|c| c.id == id).cloned())
    }

    /// Live handle for `id`
    pub fn handle(&self, id: &str) -> Result<Arc<dyn ToolServerHandle>> {
        self.connection(id)
            .and_then(|c| c.handle)
            .ok_or_else(|| Error::ToolServerUnavailable(id.to_string()))
    }

    /// Call a tool on the cached handle. Never retries.
    pub async fn invoke(&self, server_id: &str, tool: &str, arguments: Value) -> Result<CallToolResult> {
        self.handle(server_id)?.call_tool(tool, arguments).await
    }

    /// Re-establish `id` after `stale` failed. If another caller already
    /// replaced `stale`, the current handle is returned without reconnecting.
    pub async fn reconnect(
        &self,
        id: &str,
        stale: &Arc<dyn ToolServerHandle>,
    ) -> Result<Arc<dyn ToolServerHandle>> {
        let _reconnect = self.reconnect.lock().await;

        if let Some(current) = self.connection(id).and_then(|c| c.handle) {
            if !same_handle(&current, stale) {
                debug!(server = %id, "Tool server already reconnected");
                return Ok(current);
            }
        }

        let spec = self
            .registry
            .spec(id)
            .ok_or_else(|| Error::ToolServerUnavailable(id.to_string()))?;

        info!(server = %id, "Reconnecting tool server");
        let fresh = self.load_one(id, &spec).await?;
        if !self.relink(id, fresh.clone()).await {
            debug!(server = %id, "Reconnected handle is not cached");
        }
        Ok(fresh)
    }

    /// Descriptive metadata for every registry entry
    pub async fn list_info(&self) -> Vec<ToolServerInfo> {
        self.load_all().await.iter().map(ToolServerConnection::info).collect()
    }

    /// Close every live handle and drop the cache. Close errors are ignored.
    pub async fn close_all(&self) {
        let _rebuild = self.rebuild.lock().await;
        let previous = self.snapshot.write().take();
        if let Some(previous) = previous {
            close_handles(&previous.connections).await;
            info!(servers = previous.connections.len(), "Closed tool server connections");
        }
    }
}

fn or_empty<T>(id: &str, category: &str, listed: Result<Vec<T>>) -> Vec<T> {
    listed.unwrap_or_else(|e| {
        warn!(server = %id, category, error = %e, "Failed to enumerate tool server capabilities");
        Vec::new()
    })
}

fn same_handle(a: &Arc<dyn ToolServerHandle>, b: &Arc<dyn ToolServerHandle>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

async fn close_handles(connections: &[ToolServerConnection]) {
    let closing = connections.iter().filter_map(|c| {
        c.handle.as_ref().map(|handle| async move {
            if let Err(e) = handle.close().await {
                debug!(server = %c.id, error = %e, "Error closing tool server handle");
            }
        })
    });
    join_all(closing).await;
}
