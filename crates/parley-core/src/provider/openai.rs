//! OpenAI-compatible streaming chat completions

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChunkStream, CompletionProvider, ProviderRequest, StreamChunk};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Talks to any `/chat/completions` endpoint that streams SSE
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    request_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.get_api_key(),
            model: config.model.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// JSON body for a streaming request
    pub fn request_body(&self, request: &ProviderRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": request.wire_messages(),
            "stream": true,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(|t| t.to_wire()).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }

        body
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn stream_chat(&self, request: ProviderRequest) -> Result<ChunkStream> {
        let body = self.request_body(&request);
        debug!(
            model = %body["model"],
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting completion stream"
        );

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.request_timeout, builder.send())
            .await
            .map_err(|_| {
                Error::Provider(format!("No response within {:?}", self.request_timeout))
            })?
            .map_err(|e| Error::Provider(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!("HTTP {}: {}", status, text)));
        }

        let chunks = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(event) if event.data.trim() == "[DONE]");
                future::ready(!done)
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => parse_chunk(&event.data).transpose(),
                    Err(e) => Some(Err(Error::Provider(format!("Stream error: {}", e)))),
                })
            });

        Ok(chunks.boxed())
    }
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<StreamChunk>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decode one SSE data payload. Frames without choices (usage reports,
/// keep-alives) yield `None`.
fn parse_chunk(data: &str) -> Result<Option<StreamChunk>> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| Error::Provider(format!("Malformed stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::Provider(message));
    }

    Ok(chunk.choices.into_iter().next())
}
