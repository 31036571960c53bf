//! Engine facade
//!
//! Composes the session store, tool server registry, connection manager,
//! provider and orchestrator from a `Config`, and exposes the operations a
//! front end needs. Nothing returned here carries a live connection handle.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::info;

use crate::collaborators::{JsonRuleStore, PlainTextExtractor};
use crate::config::{ChatSettings, Config};
use crate::error::Result;
use crate::history::SessionStore;
use crate::mcp_manager::{ConnectionManager, Connector, McpConnector, ToolServerInfo};
use crate::message::Session;
use crate::orchestrator::{ChatInput, Orchestrator};
use crate::provider::{CompletionProvider, OpenAiProvider};
use crate::registry::{RegistryDocument, ToolServerRegistry};
use crate::stream::ChatEvent;

pub struct Engine {
    store: Arc<SessionStore>,
    registry: Arc<ToolServerRegistry>,
    connections: Arc<ConnectionManager>,
    orchestrator: Arc<Orchestrator>,
    settings: Arc<RwLock<ChatSettings>>,
}

impl Engine {
    /// Production wiring: OpenAI-compatible provider, MCP connector,
    /// file-backed stores under the configured data directory.
    pub fn open(config: Config) -> Result<Self> {
        let provider = Arc::new(OpenAiProvider::new(&config.provider)?);
        Self::with_provider(config, provider)
    }

    /// Production stores with a caller-supplied provider
    pub fn with_provider(config: Config, provider: Arc<dyn CompletionProvider>) -> Result<Self> {
        let store = Arc::new(SessionStore::new(config.history_dir()));
        let registry = Arc::new(ToolServerRegistry::open(config.registry_path())?);
        let connector = Arc::new(McpConnector::from_config(&config.mcp));
        Ok(Self::from_parts(config, store, registry, connector, provider))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<SessionStore>,
        registry: Arc<ToolServerRegistry>,
        connector: Arc<dyn Connector>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        let settings = Arc::new(RwLock::new(config.chat));
        let connections = Arc::new(ConnectionManager::new(registry.clone(), connector));
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), connections.clone(), provider)
                .with_attachments(Arc::new(PlainTextExtractor))
                .with_rules(Arc::new(JsonRuleStore::new(config.rules_path())))
                .with_settings(settings.clone()),
        );

        info!(data_dir = %config.data_dir().display(), "Engine ready");

        Self {
            store,
            registry,
            connections,
            orchestrator,
            settings,
        }
    }

    /// Start a chat; text fragments arrive as `Delta`, ending in `Done` or `Error`
    pub fn chat(&self, input: ChatInput) -> mpsc::Receiver<ChatEvent> {
        self.orchestrator.spawn_chat(input)
    }

    /// Create an empty session and return its id
    pub async fn new_session(&self) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.store.create(&session_id).await?;
        Ok(session_id)
    }

    /// All sessions, newest first
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_all().await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.get(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.store.delete(session_id).await
    }

    pub async fn delete_all_sessions(&self) -> Result<usize> {
        self.store.delete_all().await
    }

    pub fn tool_server_config(&self) -> RegistryDocument {
        self.registry.get()
    }

    pub fn tool_server_config_json(&self) -> Result<String> {
        self.registry.get_json()
    }

    /// Replace the registry; connections are rebuilt on next use
    pub async fn replace_tool_server_config(&self, document: RegistryDocument) -> Result<()> {
        self.registry.replace(document).await
    }

    pub async fn replace_tool_server_config_json(&self, text: &str) -> Result<()> {
        self.registry.replace_json(text).await
    }

    pub async fn list_tool_server_connections(&self) -> Vec<ToolServerInfo> {
        self.connections.list_info().await
    }

    pub fn chat_settings(&self) -> ChatSettings {
        *self.settings.read()
    }

    /// Takes effect from the next `chat` call
    pub fn update_chat_settings(&self, settings: ChatSettings) {
        *self.settings.write() = settings;
    }

    /// Close every tool server connection
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
    }
}
