//! Streaming response parsing
//!
//! Rebuilds text and tool calls from incremental completion chunks. Tool-call
//! fragments are split on identifier presence: a fragment carrying an id opens
//! a new call, one without continues the open call. Position indices are not
//! trusted, since providers disagree on them.

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::message::{FunctionCall, Message, ToolCallRecord};
use crate::provider::{ChunkStream, StreamChunk, ToolCallDelta};

/// Events delivered to a chat caller
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A text fragment, in arrival order
    Delta(String),
    /// The persisted assistant message; always the last event on success
    Done(Message),
    /// Terminal failure description
    Error(String),
}

/// Forwards events to a consumer that may go away at any time.
///
/// Once the receiver is dropped, further events are discarded and the
/// producer keeps running.
pub struct TextSink {
    tx: Option<mpsc::Sender<ChatEvent>>,
}

impl TextSink {
    pub fn new(tx: mpsc::Sender<ChatEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink nobody listens to
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub async fn send(&mut self, event: ChatEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                debug!("Chat consumer went away; no longer forwarding");
                self.tx = None;
            }
        }
    }

    pub async fn delta(&mut self, text: &str) {
        self.send(ChatEvent::Delta(text.to_string())).await;
    }
}

/// A tool call being assembled from fragments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments_text: String,
}

impl From<PendingToolCall> for ToolCallRecord {
    fn from(call: PendingToolCall) -> Self {
        ToolCallRecord {
            id: call.id,
            kind: "function".to_string(),
            function: FunctionCall {
                name: call.function_name,
                arguments: call.arguments_text,
            },
        }
    }
}

/// Single-pass parser over one response's chunks
#[derive(Debug, Default)]
pub struct DeltaParser {
    current: Option<PendingToolCall>,
    calls: Vec<PendingToolCall>,
    finished: bool,
}

impl DeltaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning any text to forward. Chunks after the
    /// finish signal are ignored.
    pub fn feed(&mut self, chunk: StreamChunk) -> Option<String> {
        if self.finished {
            return None;
        }

        for delta in chunk.delta.tool_calls {
            self.apply(delta);
        }

        if chunk.finish_reason.is_some() {
            self.flush();
            self.finished = true;
        }

        chunk.delta.content.filter(|text| !text.is_empty())
    }

    fn apply(&mut self, delta: ToolCallDelta) {
        match delta.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                self.flush();
                self.current = Some(PendingToolCall {
                    id,
                    function_name: delta.function.name.unwrap_or_default(),
                    arguments_text: delta.function.arguments.unwrap_or_default(),
                });
            }
            None => match self.current.as_mut() {
                Some(current) => {
                    if current.function_name.is_empty() {
                        if let Some(name) = delta.function.name {
                            current.function_name = name;
                        }
                    }
                    if let Some(fragment) = delta.function.arguments {
                        current.arguments_text.push_str(&fragment);
                    }
                }
                None => trace!("Tool call continuation with no open call"),
            },
        }
    }

    fn flush(&mut self) {
        if let Some(call) = self.current.take() {
            self.calls.push(call);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close the open call, if any, and return every call seen
    pub fn finish(mut self) -> Vec<PendingToolCall> {
        self.flush();
        self.calls
    }
}

/// What one provider response produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub text: String,
    pub tool_calls: Vec<PendingToolCall>,
}

/// Drain `stream` through a `DeltaParser`, forwarding text to `sink` as it
/// arrives. Stops at the finish signal or the end of the stream.
pub async fn parse_stream(mut stream: ChunkStream, sink: &mut TextSink) -> Result<ParsedResponse> {
    let mut parser = DeltaParser::new();
    let mut text = String::new();

    while let Some(chunk) = stream.next().await {
        if let Some(delta) = parser.feed(chunk?) {
            text.push_str(&delta);
            sink.delta(&delta).await;
        }
        if parser.is_finished() {
            break;
        }
    }

    Ok(ParsedResponse {
        text,
        tool_calls: parser.finish(),
    })
}
