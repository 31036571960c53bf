//! Parley Core - conversational orchestration engine
//!
//! This crate sits between a chat surface, a streaming chat-completion
//! provider and a dynamic set of MCP tool servers. It turns a user message
//! plus stored context into a final assistant reply, running the tool calls
//! the model asks for along the way, streaming text as it arrives and
//! persisting the conversation.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod mcp_manager;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod stream;

pub use collaborators::{
    AttachmentExtractor, JsonRuleStore, PlainTextExtractor, RuleSource, SettingsSource, StaticRules,
};
pub use config::{ChatSettings, Config, ConfigManager};
pub use engine::Engine;
pub use error::{Error, Result};
pub use history::SessionStore;
pub use mcp_manager::{
    ConnectionManager, Connector, McpConnector, ToolServerConnection, ToolServerHandle, ToolServerInfo,
};
pub use message::{FunctionCall, Message, Role, Session, ToolCallRecord};
pub use orchestrator::{ChatInput, Orchestrator, TOOL_NAME_SEPARATOR};
pub use provider::{CompletionProvider, OpenAiProvider, ProviderRequest, StreamChunk, ToolDefinition};
pub use registry::{RegistryDocument, ServerSpec, ToolServerRegistry};
pub use stream::{ChatEvent, DeltaParser, TextSink};
