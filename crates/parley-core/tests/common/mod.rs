//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use parley_core::provider::ChunkStream;
use parley_core::{
    CompletionProvider, Connector, Error, ProviderRequest, Result, ServerSpec, StreamChunk, ToolServerHandle,
};
use parley_mcp::{CallToolResult, ContentItem, McpError, McpPrompt, McpResource, McpTool};

/// How a fake server answers `tools/call`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallBehaviour {
    /// Returns `a + b` as text
    Add,
    /// The connection is broken
    TransportFailure,
    /// The server rejects the request
    ServerError,
}

pub struct FakeHandle {
    pub server: String,
    pub behaviour: CallBehaviour,
    pub fail_prompts: bool,
    pub fail_close: bool,
    pub calls: Mutex<Vec<(String, Value)>>,
    pub closed: AtomicBool,
}

impl FakeHandle {
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn add_tool() -> McpTool {
    McpTool {
        name: "add".to_string(),
        description: "Add two numbers".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
        }),
    }
}

#[async_trait]
impl ToolServerHandle for FakeHandle {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(vec![add_tool()])
    }

    async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        if self.fail_prompts {
            return Err(Error::Mcp(McpError::Server("prompts/list failed (-32601): Method not found".into())));
        }
        Ok(vec![McpPrompt {
            name: "summarize".to_string(),
            description: None,
            arguments: Vec::new(),
        }])
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
        match self.behaviour {
            CallBehaviour::Add => {
                let a = arguments["a"].as_i64().unwrap_or(0);
                let b = arguments["b"].as_i64().unwrap_or(0);
                Ok(CallToolResult {
                    content: vec![ContentItem::text((a + b).to_string())],
                    is_error: false,
                    structured_content: None,
                })
            }
            CallBehaviour::TransportFailure => Err(Error::Mcp(McpError::Transport("broken pipe".into()))),
            CallBehaviour::ServerError => Err(Error::Mcp(McpError::Server(
                "tools/call failed (-32602): Invalid params".into(),
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(Error::Mcp(McpError::Transport("already broken".into())));
        }
        Ok(())
    }
}

/// Outcome of one connect attempt
#[derive(Debug, Clone, Copy)]
pub enum Plan {
    Fail,
    Connect(CallBehaviour),
    ConnectWithoutPrompts(CallBehaviour),
    /// Connects, but `close` reports an error
    ConnectFailingClose(CallBehaviour),
}

/// Connector whose outcomes are scripted per server. The last planned
/// outcome repeats; unplanned servers connect with `CallBehaviour::Add`.
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    plans: Mutex<HashMap<String, VecDeque<Plan>>>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, id: &str, plans: Vec<Plan>) -> Self {
        self.plans.lock().unwrap().insert(id.to_string(), plans.into());
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every handle handed out, in order
    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles.lock().unwrap().clone()
    }

    pub fn handles_for(&self, id: &str) -> Vec<Arc<FakeHandle>> {
        self.handles().into_iter().filter(|h| h.server == id).collect()
    }

    fn next_plan(&self, id: &str) -> Plan {
        let mut plans = self.plans.lock().unwrap();
        match plans.get_mut(id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Plan::Connect(CallBehaviour::Add)),
            Some(queue) => queue.front().copied().unwrap_or(Plan::Connect(CallBehaviour::Add)),
            None => Plan::Connect(CallBehaviour::Add),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, id: &str, _spec: &ServerSpec) -> Result<Arc<dyn ToolServerHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (behaviour, fail_prompts, fail_close) = match self.next_plan(id) {
            Plan::Fail => return Err(Error::Mcp(McpError::Transport("connection refused".into()))),
            Plan::Connect(behaviour) => (behaviour, false, false),
            Plan::ConnectWithoutPrompts(behaviour) => (behaviour, true, false),
            Plan::ConnectFailingClose(behaviour) => (behaviour, false, true),
        };

        let handle = Arc::new(FakeHandle {
            server: id.to_string(),
            behaviour,
            fail_prompts,
            fail_close,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

/// Provider replaying canned responses. The last response repeats.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<std::result::Result<Vec<StreamChunk>, String>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<std::result::Result<Vec<StreamChunk>, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);
        let response = {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            }
        };

        match response {
            Some(Ok(chunks)) => Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Some(Err(message)) => Err(Error::Provider(message)),
            None => Err(Error::Provider("no scripted response".into())),
        }
    }
}

/// Text-only response
pub fn text_response(parts: &[&str]) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = parts.iter().map(|p| StreamChunk::text(*p)).collect();
    chunks.push(StreamChunk::finish("stop"));
    chunks
}

/// One tool call, arguments streamed a character at a time
pub fn tool_call_response(id: &str, name: &str, arguments: &str) -> Vec<StreamChunk> {
    let mut chunks = vec![StreamChunk::tool_call(id, name, "")];
    chunks.extend(arguments.chars().map(|c| StreamChunk::tool_arguments(c.to_string())));
    chunks.push(StreamChunk::finish("tool_calls"));
    chunks
}
