//! Orchestrator integration tests
//!
//! Drives full `chat` calls against a scripted provider and fake tool servers:
//! - Plain text replies and persistence
//! - Tool call rounds and namespacing
//! - Round limit, reconnect-once and error persistence
//! - Context assembly from history, attachments and rules

mod common;

use std::sync::Arc;

use common::{text_response, tool_call_response, CallBehaviour, FakeConnector, Plan, ScriptedProvider};
use parley_core::{
    ChatEvent, ChatInput, ChatSettings, ConnectionManager, Error, Message, Orchestrator, RegistryDocument, Role,
    ServerSpec, SessionStore, StaticRules, StreamChunk, TextSink, ToolServerRegistry,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    _dir: TempDir,
    store: Arc<SessionStore>,
    connector: Arc<FakeConnector>,
    provider: Arc<ScriptedProvider>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(servers: &[&str], connector: FakeConnector, provider: ScriptedProvider) -> Harness {
    harness_with(servers, connector, provider, ChatSettings::default(), Vec::new())
}

fn harness_with(
    servers: &[&str],
    connector: FakeConnector,
    provider: ScriptedProvider,
    settings: ChatSettings,
    rules: Vec<String>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(dir.path().join("history")));
    let document = servers.iter().fold(RegistryDocument::default(), |doc, id| {
        doc.with_server(*id, ServerSpec::process("fake", Vec::new()))
    });
    let registry = Arc::new(ToolServerRegistry::in_memory(document));
    let connector = Arc::new(connector);
    let provider = Arc::new(provider);
    let connections = Arc::new(ConnectionManager::new(registry, connector.clone()));

    let orchestrator = Orchestrator::new(store.clone(), connections, provider.clone())
        .with_settings(Arc::new(settings))
        .with_rules(Arc::new(StaticRules(rules)));

    Harness {
        _dir: dir,
        store,
        connector,
        provider,
        orchestrator: Arc::new(orchestrator),
    }
}

/// Run a chat, collecting every event
async fn chat(h: &Harness, input: ChatInput) -> (Result<Message, Error>, Vec<ChatEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let mut sink = TextSink::new(tx);
    let result = h.orchestrator.chat(input, &mut sink).await;
    drop(sink);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

fn deltas(events: &[ChatEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Delta(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn hello(session: &str) -> ChatInput {
    ChatInput::new(session, vec![Message::user("hello")])
}

mod text_tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_reply_streams_and_persists() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["Hi", " there"]))]));

        let (result, events) = chat(&h, hello("s1")).await;
        let reply = result.unwrap();
        assert_eq!(reply.content, "Hi there");
        assert_eq!(deltas(&events), vec!["Hi", " there"]);
        assert!(matches!(events.last(), Some(ChatEvent::Done(m)) if m.content == "Hi there"));

        assert_eq!(h.provider.requests().len(), 1);

        let session = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "hello");
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].content, "Hi there");
        assert!(!session.messages[1].is_error);
    }

    #[tokio::test]
    async fn test_no_tools_offered_without_servers() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["ok"]))]));
        chat(&h, hello("s1")).await.0.unwrap();
        assert!(h.provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_chat_streams_events() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["a", "b"]))]));

        let mut rx = h.orchestrator.spawn_chat(hello("s1"));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(deltas(&events), vec!["a", "b"]);
        assert!(matches!(events.last(), Some(ChatEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_dropped_consumer_still_persists() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["a", "b"]))]));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = TextSink::new(tx);
        let reply = h.orchestrator.chat(hello("s1"), &mut sink).await.unwrap();

        assert_eq!(reply.content, "ab");
        assert_eq!(h.store.get("s1").await.unwrap().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_persisted_ids_distinct_and_increasing() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["ok"]))]));
        for _ in 0..5 {
            chat(&h, hello("s1")).await.0.unwrap();
        }

        let ids: Vec<i64> = h.store.get("s1").await.unwrap().unwrap().messages.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 10);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}

mod tool_round_tests {
    use super::*;

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let h = harness(
            &["srv1"],
            FakeConnector::new(),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "srv1::add", r#"{"a":1,"b":2}"#)),
                Ok(text_response(&["The answer is 3"])),
            ]),
        );

        let (result, events) = chat(&h, ChatInput::new("s1", vec![Message::user("add 1 and 2")])).await;
        assert_eq!(result.unwrap().content, "The answer is 3");
        assert_eq!(deltas(&events), vec!["The answer is 3"]);

        // The tool list is namespaced by server id
        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[0].tools[0].name, "srv1::add");

        // The server saw the bare tool name and parsed arguments
        let calls = h.connector.handles_for("srv1")[0].calls();
        assert_eq!(calls, vec![("add".to_string(), json!({ "a": 1, "b": 2 }))]);

        // Round two carries the call and its result
        let round_two = &requests[1].messages;
        let assistant = round_two
            .iter()
            .find(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
            .expect("assistant tool call message");
        assert_eq!(assistant.tool_calls[0].id, "c1");
        assert_eq!(assistant.tool_calls[0].function.name, "srv1::add");
        assert_eq!(assistant.tool_calls[0].function.arguments, r#"{"a":1,"b":2}"#);

        let tool = round_two.iter().find(|m| m.role == Role::Tool).expect("tool result message");
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
        let content: Value = serde_json::from_str(&tool.content).unwrap();
        assert_eq!(content["content"][0]["text"], "3");

        // Only the user turn and the final answer are persisted
        let session = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "The answer is 3");
    }

    #[tokio::test]
    async fn test_several_calls_in_one_round() {
        let mut chunks = vec![
            StreamChunk::tool_call("c1", "srv1::add", r#"{"a":1,"#),
            StreamChunk::tool_arguments(r#""b":1}"#),
            StreamChunk::tool_call("c2", "srv2::add", r#"{"a":2,"b":2}"#),
        ];
        chunks.push(StreamChunk::finish("tool_calls"));

        let h = harness(
            &["srv1", "srv2"],
            FakeConnector::new(),
            ScriptedProvider::new(vec![Ok(chunks), Ok(text_response(&["2 and 4"]))]),
        );
        chat(&h, hello("s1")).await.0.unwrap();

        let round_two = &h.provider.requests()[1].messages;
        let ids: Vec<_> = round_two
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(h.connector.handles_for("srv1")[0].calls()[0].1, json!({ "a": 1, "b": 1 }));
        assert_eq!(h.connector.handles_for("srv2")[0].calls()[0].1, json!({ "a": 2, "b": 2 }));
    }

    #[tokio::test]
    async fn test_unknown_server_yields_tool_message() {
        let h = harness(
            &["srv1"],
            FakeConnector::new(),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "ghost::add", "{}")),
                Ok(text_response(&["sorry"])),
            ]),
        );

        let (result, _) = chat(&h, hello("s1")).await;
        assert_eq!(result.unwrap().content, "sorry");

        let round_two = &h.provider.requests()[1].messages;
        let tool = round_two.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool.content.contains("ghost"));
        assert!(tool.is_error);
    }

    #[tokio::test]
    async fn test_disconnected_server_yields_tool_message() {
        let h = harness(
            &["srv1"],
            FakeConnector::new().plan("srv1", vec![Plan::Fail]),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "srv1::add", "{}")),
                Ok(text_response(&["unavailable"])),
            ]),
        );

        let (result, _) = chat(&h, hello("s1")).await;
        assert!(result.is_ok());
        assert!(h.provider.requests()[0].tools.is_empty());
        let tool_messages = h.provider.requests()[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(tool_messages, 1);
    }

    #[tokio::test]
    async fn test_malformed_arguments_become_empty_object() {
        let h = harness(
            &["srv1"],
            FakeConnector::new(),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "srv1::add", r#"{"a": 1,"#)),
                Ok(text_response(&["0"])),
            ]),
        );

        chat(&h, hello("s1")).await.0.unwrap();
        assert_eq!(h.connector.handles_for("srv1")[0].calls()[0].1, json!({}));
    }

    #[tokio::test]
    async fn test_server_error_reported_without_reconnect() {
        let h = harness(
            &["srv1"],
            FakeConnector::new().plan("srv1", vec![Plan::Connect(CallBehaviour::ServerError)]),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "srv1::add", "{}")),
                Ok(text_response(&["bad params"])),
            ]),
        );

        let (result, _) = chat(&h, hello("s1")).await;
        assert!(result.is_ok());
        assert_eq!(h.connector.connect_count(), 1);

        let round_two = &h.provider.requests()[1].messages;
        let tool = round_two.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool.is_error);
        assert!(tool.content.contains("Invalid params"));
    }

    #[tokio::test]
    async fn test_round_limit_terminates() {
        let settings = ChatSettings {
            max_tool_rounds: 3,
            context_length: 50,
        };
        let h = harness_with(
            &["srv1"],
            FakeConnector::new(),
            ScriptedProvider::new(vec![Ok(tool_call_response("c1", "srv1::add", "{}"))]),
            settings,
            Vec::new(),
        );

        let (result, events) = chat(&h, hello("s1")).await;
        let reply = result.unwrap();

        assert_eq!(h.provider.requests().len(), 3);
        assert!(reply.content.contains("Stopped after 3 tool rounds"));
        assert_eq!(deltas(&events).concat(), reply.content);

        let session = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.last().unwrap().content, reply.content);
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_failure_reconnects_once() {
        let h = harness(
            &["srv1"],
            FakeConnector::new().plan(
                "srv1",
                vec![
                    Plan::Connect(CallBehaviour::TransportFailure),
                    Plan::Connect(CallBehaviour::Add),
                ],
            ),
            ScriptedProvider::new(vec![
                Ok(tool_call_response("c1", "srv1::add", r#"{"a":1,"b":2}"#)),
                Ok(text_response(&["3"])),
            ]),
        );

        let (result, _) = chat(&h, hello("s1")).await;
        assert_eq!(result.unwrap().content, "3");
        assert_eq!(h.connector.connect_count(), 2);

        let handles = h.connector.handles_for("srv1");
        assert_eq!(handles[0].calls().len(), 1);
        assert!(handles[0].is_closed());
        assert_eq!(handles[1].calls().len(), 1);

        let round_two = &h.provider.requests()[1].messages;
        let tool = round_two.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(!tool.is_error);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal_and_persisted() {
        let h = harness(
            &["srv1"],
            FakeConnector::new().plan("srv1", vec![Plan::Connect(CallBehaviour::TransportFailure)]),
            ScriptedProvider::new(vec![Ok(tool_call_response("c1", "srv1::add", "{}"))]),
        );

        let (result, events) = chat(&h, hello("s1")).await;
        let err = result.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.connector.connect_count(), 2);
        assert_eq!(h.provider.requests().len(), 1);
        assert!(matches!(events.last(), Some(ChatEvent::Error(_))));

        let session = h.store.get("s1").await.unwrap().unwrap();
        let last = session.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.is_error);
        assert!(last.content.contains("broken pipe"));
    }

    #[tokio::test]
    async fn test_provider_error_is_persisted() {
        let h = harness(
            &[],
            FakeConnector::new(),
            ScriptedProvider::new(vec![Err("HTTP 503: overloaded".to_string())]),
        );

        let (result, events) = chat(&h, hello("s1")).await;
        assert!(matches!(result, Err(Error::Provider(_))));
        assert!(matches!(events.last(), Some(ChatEvent::Error(m)) if m.contains("overloaded")));

        let session = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "hello");
        assert!(session.messages[1].is_error);
    }

    #[tokio::test]
    async fn test_invalid_session_id_rejected() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["x"]))]));
        let (result, events) = chat(&h, hello("../etc")).await;
        assert!(matches!(result, Err(Error::InvalidSessionId(_))));
        assert!(matches!(events.as_slice(), [ChatEvent::Error(_)]));
        assert!(h.provider.requests().is_empty());
    }
}

mod context_tests {
    use super::*;

    #[tokio::test]
    async fn test_history_precedes_new_input_once() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["reply"]))]));
        chat(&h, ChatInput::new("s1", vec![Message::user("first")])).await.0.unwrap();
        chat(&h, ChatInput::new("s1", vec![Message::user("second")])).await.0.unwrap();

        let contents: Vec<_> = h.provider.requests()[1]
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["first", "reply", "second"]);
    }

    #[tokio::test]
    async fn test_corrupt_history_is_not_fatal() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["ok"]))]));
        std::fs::create_dir_all(h.store.dir()).unwrap();
        std::fs::write(h.store.dir().join("s1.json"), "{ not json").unwrap();

        let (result, events) = chat(&h, hello("s1")).await;
        assert_eq!(result.unwrap().content, "ok");
        assert!(matches!(events.last(), Some(ChatEvent::Done(m)) if m.content == "ok"));

        let contents: Vec<_> = h.provider.requests()[0].messages.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_unwritable_history_is_not_fatal() {
        let h = harness(&[], FakeConnector::new(), ScriptedProvider::new(vec![Ok(text_response(&["ok"]))]));
        // A plain file where the history directory should be
        std::fs::write(h.store.dir(), "").unwrap();

        let (result, events) = chat(&h, hello("s1")).await;
        assert_eq!(result.unwrap().content, "ok");
        assert!(matches!(events.last(), Some(ChatEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_context_length_takes_leading_messages() {
        let settings = ChatSettings {
            max_tool_rounds: 5,
            context_length: 2,
        };
        let h = harness_with(
            &[],
            FakeConnector::new(),
            ScriptedProvider::new(vec![Ok(text_response(&["r"]))]),
            settings,
            Vec::new(),
        );
        for text in ["one", "two", "three"] {
            chat(&h, ChatInput::new("s1", vec![Message::user(text)])).await.0.unwrap();
        }

        let contents: Vec<_> = h.provider.requests()[2]
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["one", "r"]);
    }

    #[tokio::test]
    async fn test_attachments_and_rules_injected_not_persisted() {
        let h = harness_with(
            &[],
            FakeConnector::new(),
            ScriptedProvider::new(vec![Ok(text_response(&["done"]))]),
            ChatSettings::default(),
            vec!["Answer in English".to_string(), "Be brief".to_string()],
        );
        let file = h._dir.path().join("notes.txt");
        std::fs::write(&file, "meeting at noon").unwrap();

        let input = ChatInput::new("s1", vec![Message::user("summarize")])
            .with_attachments(vec![file.to_string_lossy().into_owned()])
            .with_model("local-model");
        chat(&h, input).await.0.unwrap();

        let request = &h.provider.requests()[0];
        assert_eq!(request.model.as_deref(), Some("local-model"));
        assert_eq!(request.messages.len(), 3);
        assert!(request.messages[1].content.contains("meeting at noon"));
        assert_eq!(request.messages[1].role, Role::User);
        assert!(request.messages[2].content.contains("Answer in English\nBe brief"));

        let session = h.store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
    }
}
