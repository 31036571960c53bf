//! Completion provider abstraction
//!
//! The engine consumes a streaming chat-completion API. Requests carry the
//! conversation plus an optional tool list; responses arrive as a stream of
//! incremental chunks in the OpenAI `chat.completion.chunk` shape.

mod openai;

pub use openai::OpenAiProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::message::{Message, Role};

/// A stream of response chunks
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// Streaming chat-completion backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a completion. Errors before the first chunk (connection, HTTP
    /// status) are returned here; later failures arrive inside the stream.
    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChunkStream>;
}

/// A tool offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    /// OpenAI `tools[]` entry
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// One provider call
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Falls back to the provider's configured model
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl ProviderRequest {
    /// Messages in OpenAI wire form
    pub fn wire_messages(&self) -> Vec<Value> {
        self.messages.iter().map(message_to_wire).collect()
    }
}

fn message_to_wire(message: &Message) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({
                "role": "assistant",
                "content": content,
                "tool_calls": message.tool_calls,
            })
        }
        role => json!({
            "role": role.as_str(),
            "content": message.content,
        }),
    }
}

/// One incremental piece of a streamed response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamChunk {
    #[serde(default, deserialize_with = "null_as_default")]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: Vec<ToolCallDelta>,
}

/// Fragment of a tool call. A present `id` opens a new call; an absent one
/// continues the current call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            delta: ChunkDelta {
                content: Some(content.into()),
                tool_calls: Vec::new(),
            },
            finish_reason: None,
        }
    }

    /// Opening fragment of a tool call
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::with_tool_delta(ToolCallDelta {
            index: None,
            id: Some(id.into()),
            function: FunctionDelta {
                name: Some(name.into()),
                arguments: Some(arguments.into()),
            },
        })
    }

    /// Argument continuation for the call in progress
    pub fn tool_arguments(arguments: impl Into<String>) -> Self {
        Self::with_tool_delta(ToolCallDelta {
            index: None,
            id: None,
            function: FunctionDelta {
                name: None,
                arguments: Some(arguments.into()),
            },
        })
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            delta: ChunkDelta::default(),
            finish_reason: Some(reason.into()),
        }
    }

    fn with_tool_delta(delta: ToolCallDelta) -> Self {
        Self {
            delta: ChunkDelta {
                content: None,
                tool_calls: vec![delta],
            },
            finish_reason: None,
        }
    }
}
