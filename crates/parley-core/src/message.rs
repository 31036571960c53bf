//! Conversation data model
//!
//! `Message` is the unit stored in session history and sent to the provider.
//! Keys serialize in camelCase so stored sessions stay readable by the UI layer.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation requested by the assistant, in provider wire shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text exactly as the provider streamed it
    pub arguments: String,
}

/// A single conversation message. Immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Millisecond timestamp at creation, bumped to stay unique
    pub id: i64,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Local display timestamp
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub is_error: bool,
    /// Set on `tool` messages: the call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

static LAST_MESSAGE_ID: AtomicI64 = AtomicI64::new(0);

/// Current time in milliseconds, strictly greater than any id handed out before.
fn next_message_id() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_MESSAGE_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MESSAGE_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: next_message_id(),
            role,
            content: content.into(),
            time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            is_error: false,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Assistant turn that asked for tool calls
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRecord>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.tool_calls = calls;
        message
    }

    /// Result of one tool call
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(call_id.into());
        message
    }

    /// Mark the message as carrying a failure description
    pub fn with_error(mut self) -> Self {
        self.is_error = true;
        self
    }
}

/// A persisted conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub created_time: DateTime<Utc>,
    pub messages: Vec<Message>,
}
