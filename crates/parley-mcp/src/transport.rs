//! MCP Transport layer implementations

use std::collections::{HashMap, VecDeque};
use std::io;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::protocol;

/// Header carrying the server-assigned session for streamable HTTP
const SESSION_HEADER: &str = "mcp-session-id";

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, message: Value) -> io::Result<()>;
    /// Next inbound message, or `None` once the peer has gone away.
    async fn receive(&mut self) -> io::Result<Option<Value>>;
    async fn close(&mut self) -> io::Result<()>;
}

/// Stdio transport for subprocess communication (newline-delimited JSON)
pub struct StdioTransport {
    child: Child,
    reader: Option<BufReader<ChildStdout>>,
}

impl StdioTransport {
    /// Spawn `command` with `args`, adding `env` on top of the inherited
    /// environment.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> io::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;

        debug!(command, pid = ?child.id(), "Spawned MCP server process");

        Ok(Self {
            child,
            reader: Some(BufReader::new(stdout)),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "Stdin not available"))?;

        let json = serde_json::to_string(&message)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "Reader not available"))?;

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;

            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }

            // Servers sometimes print banners on stdout
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => debug!(line = line.trim(), error = %e, "Skipping non-JSON line from server"),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.reader = None;
        self.child.stdin = None;
        // Already-exited children report InvalidInput; nothing left to do then.
        match self.child.kill().await {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }
}

/// Streamable HTTP transport: every message is POSTed, and the reply comes
/// back either as a JSON body or as a short-lived SSE stream.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Option<String>,
    inbox: VecDeque<Value>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: &HashMap<String, String>) -> io::Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            url: url.into(),
            client: reqwest::Client::new(),
            headers: header_map,
            session_id: None,
            inbox: VecDeque::new(),
        })
    }

    fn enqueue(&mut self, value: Value) {
        match value {
            Value::Array(batch) => self.inbox.extend(batch),
            single => self.inbox.push_back(single),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await.map_err(io::Error::other)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(io::Error::other(format!("HTTP {}: {}", status, body)));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| io::Error::other(e.to_string()))?;
                if event.data.trim().is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(&event.data)?;
                let done = protocol::is_response(&value);
                self.enqueue(value);
                if done {
                    break;
                }
            }
        } else {
            let body = response.bytes().await.map_err(io::Error::other)?;
            if !body.is_empty() {
                let value: Value = serde_json::from_slice(&body)?;
                self.enqueue(value);
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inbox.clear();
        if let Some(session_id) = self.session_id.take() {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                warn!(url = %self.url, error = %e, "Failed to end MCP HTTP session");
            }
        }
        Ok(())
    }
}
