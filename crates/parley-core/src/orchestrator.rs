//! Conversation orchestration
//!
//! Runs one `chat` call: persists the new input, assembles context from
//! history, attachments and rules, then alternates provider calls and tool
//! executions until the model answers without tool calls or the round limit is
//! reached. Exactly one assistant message is persisted per call.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_mcp::CallToolResult;

use crate::collaborators::{AttachmentExtractor, PlainTextExtractor, RuleSource, SettingsSource, StaticRules};
use crate::config::ChatSettings;
use crate::error::Result;
use crate::history::{validate_session_id, SessionStore};
use crate::mcp_manager::{ConnectionManager, ToolServerConnection};
use crate::message::{Message, ToolCallRecord};
use crate::provider::{CompletionProvider, ProviderRequest, ToolDefinition};
use crate::stream::{parse_stream, ChatEvent, PendingToolCall, TextSink};

/// Joins a server id and a tool name into the name the model sees.
///
/// api.openai.com only accepts function names matching `^[a-zA-Z0-9_-]{1,64}$`
/// and answers HTTP 400 to any request offering tools named this way; point
/// `provider.base_url` at a backend that allows `:` in function names.
pub const TOOL_NAME_SEPARATOR: &str = "::";

/// Capacity of the event channel returned by `spawn_chat`
const CHAT_EVENT_BUFFER: usize = 64;

/// One chat request
#[derive(Debug, Clone)]
pub struct ChatInput {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Overrides the provider's default model
    pub model: Option<String>,
    /// Attachment references handed to the extractor
    pub attachments: Vec<String>,
}

impl ChatInput {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            model: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// The multi-round tool-calling loop
pub struct Orchestrator {
    store: Arc<SessionStore>,
    connections: Arc<ConnectionManager>,
    provider: Arc<dyn CompletionProvider>,
    attachments: Arc<dyn AttachmentExtractor>,
    rules: Arc<dyn RuleSource>,
    settings: Arc<dyn SettingsSource>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        connections: Arc<ConnectionManager>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            store,
            connections,
            provider,
            attachments: Arc::new(PlainTextExtractor),
            rules: Arc::new(StaticRules::default()),
            settings: Arc::new(ChatSettings::default()),
        }
    }

    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentExtractor>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn RuleSource>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = settings;
        self
    }

    /// Run `chat` on a background task and stream its events
    pub fn spawn_chat(self: &Arc<Self>, input: ChatInput) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(CHAT_EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut sink = TextSink::new(tx);
            let _ = orchestrator.chat(input, &mut sink).await;
        });
        rx
    }

    /// Answer `input`, forwarding text to `sink` as it streams. The sink
    /// receives `Done` with the persisted message on success, `Error` on
    /// failure.
    pub async fn chat(&self, input: ChatInput, sink: &mut TextSink) -> Result<Message> {
        let session_id = input.session_id.clone();
        if let Err(e) = validate_session_id(&session_id) {
            sink.send(ChatEvent::Error(e.to_string())).await;
            return Err(e);
        }

        let settings = self.settings.chat_settings();
        info!(
            session_id = %session_id,
            messages = input.messages.len(),
            attachments = input.attachments.len(),
            "Chat started"
        );

        // Read before appending: appending first would put this turn in the
        // slice and then send it a second time with the inputs below
        let history = match self.store.bounded_slice(&session_id, settings.context_length).await {
            Ok(history) => history,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read history; continuing without it");
                Vec::new()
            }
        };

        for message in &input.messages {
            self.persist(&session_id, message).await;
        }

        let mut conversation = history;
        conversation.extend(input.messages.iter().cloned());
        self.inject_context(&mut conversation, &input.attachments).await;

        match self.run_rounds(conversation, input.model, settings, sink).await {
            Ok(text) => {
                let message = Message::assistant(text);
                self.persist(&session_id, &message).await;
                info!(session_id = %session_id, chars = message.content.len(), "Chat finished");
                sink.send(ChatEvent::Done(message.clone())).await;
                Ok(message)
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Chat failed");
                let message = Message::assistant(e.to_string()).with_error();
                self.persist(&session_id, &message).await;
                sink.send(ChatEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Storage failures never block the conversation
    async fn persist(&self, session_id: &str, message: &Message) {
        if let Err(e) = self.store.append(session_id, Some(message)).await {
            warn!(session_id, error = %e, "Failed to persist message");
        }
    }

    async fn inject_context(&self, conversation: &mut Vec<Message>, attachments: &[String]) {
        if !attachments.is_empty() {
            let texts = join_all(attachments.iter().map(|a| self.attachments.extract_text(a))).await;
            conversation.push(Message::user(texts.join("\n\n")));
        }

        let rules = self.rules.list_rules().await;
        if !rules.is_empty() {
            conversation.push(Message::user(format!(
                "Follow these rules when answering:\n{}",
                rules.join("\n")
            )));
        }
    }

    async fn run_rounds(
        &self,
        mut conversation: Vec<Message>,
        model: Option<String>,
        settings: ChatSettings,
        sink: &mut TextSink,
    ) -> Result<String> {
        let connections = self.connections.load_all().await;
        let tools = tool_definitions(&connections);
        let max_rounds = settings.max_tool_rounds.max(1);
        let mut response_text = String::new();

        for round in 1..=max_rounds {
            // Leading slice, oldest first
            let request = ProviderRequest {
                model: model.clone(),
                messages: conversation.iter().take(settings.context_length).cloned().collect(),
                tools: tools.clone(),
            };
            debug!(round, messages = request.messages.len(), tools = tools.len(), "Calling provider");

            let stream = self.provider.stream_chat(request).await?;
            let parsed = parse_stream(stream, sink).await?;
            response_text.push_str(&parsed.text);

            if parsed.tool_calls.is_empty() {
                debug!(round, "Provider answered without tool calls");
                return Ok(response_text);
            }

            info!(round, calls = parsed.tool_calls.len(), "Executing tool calls");
            let records: Vec<ToolCallRecord> = parsed.tool_calls.iter().cloned().map(Into::into).collect();
            conversation.push(Message::assistant_tool_calls(parsed.text, records));

            let results = join_all(parsed.tool_calls.iter().map(|call| self.execute_tool_call(call))).await;
            for result in results {
                conversation.push(result?);
            }
        }

        warn!(max_rounds, "Tool round limit reached without a final answer");
        let mut notice = format!("[Stopped after {} tool rounds without a final answer]", max_rounds);
        if !response_text.is_empty() {
            notice.insert_str(0, "\n\n");
        }
        sink.delta(&notice).await;
        response_text.push_str(&notice);
        Ok(response_text)
    }

    /// Run one tool call and produce its result message. Lookup failures,
    /// server-side errors and tool errors become message content; only a
    /// second transport failure is returned as `Err`.
    async fn execute_tool_call(&self, call: &PendingToolCall) -> Result<Message> {
        let Some((server_id, tool_name)) = call.function_name.split_once(TOOL_NAME_SEPARATOR) else {
            warn!(tool = %call.function_name, "Tool name has no server prefix");
            return Ok(Message::tool(&call.id, format!("Unknown tool '{}'", call.function_name)).with_error());
        };

        let arguments = parse_arguments(&call.arguments_text);

        let handle = match self.connections.connection(server_id) {
            Some(connection) if connection.connected => connection.handle().cloned(),
            _ => None,
        };
        let Some(handle) = handle else {
            warn!(server = %server_id, tool = %tool_name, "Tool server not connected");
            return Ok(Message::tool(
                &call.id,
                format!("Tool server '{}' is not available", server_id),
            )
            .with_error());
        };

        debug!(server = %server_id, tool = %tool_name, "Invoking tool");
        let result = match handle.call_tool(tool_name, arguments.clone()).await {
            Ok(result) => result,
            Err(e) if e.is_transport() => {
                warn!(server = %server_id, tool = %tool_name, error = %e, "Tool call failed; reconnecting once");
                let fresh = self.connections.reconnect(server_id, &handle).await?;
                fresh.call_tool(tool_name, arguments).await?
            }
            Err(e) => {
                warn!(server = %server_id, tool = %tool_name, error = %e, "Tool call rejected");
                return Ok(Message::tool(&call.id, format!("Tool '{}' failed: {}", tool_name, e)).with_error());
            }
        };

        let message = Message::tool(&call.id, result_content(&result));
        Ok(if result.is_error { message.with_error() } else { message })
    }
}

/// Provider tool list from every connected server, names namespaced
pub fn tool_definitions(connections: &[ToolServerConnection]) -> Vec<ToolDefinition> {
    connections
        .iter()
        .filter(|c| c.connected)
        .flat_map(|c| {
            c.tools.iter().map(move |tool| ToolDefinition {
                name: format!("{}{}{}", c.id, TOOL_NAME_SEPARATOR, tool.name),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
        })
        .collect()
}

/// Arguments as a JSON object; anything else becomes `{}`
fn parse_arguments(text: &str) -> Value {
    if text.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(arguments = %other, "Tool arguments are not an object; using {{}}");
            json!({})
        }
        Err(e) => {
            warn!(error = %e, "Unparseable tool arguments; using {{}}");
            json!({})
        }
    }
}

fn result_content(result: &CallToolResult) -> String {
    serde_json::to_string(result).unwrap_or_else(|_| result.text())
}
