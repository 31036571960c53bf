//! Services the orchestrator consults but does not own
//!
//! Attachment text extraction, standing rules injected as guidance, and the
//! two chat limits. Each is a trait so embedders can plug in their own store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::ChatSettings;

/// Turns an attachment reference into plain text
#[async_trait]
pub trait AttachmentExtractor: Send + Sync {
    /// Never fails: an unreadable attachment yields a notice in its place.
    async fn extract_text(&self, file_ref: &str) -> String;
}

/// Reads attachments as UTF-8 text files (lossy)
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl AttachmentExtractor for PlainTextExtractor {
    async fn extract_text(&self, file_ref: &str) -> String {
        let name = Path::new(file_ref)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_ref.to_string());

        match tokio::fs::read(file_ref).await {
            Ok(bytes) => format!("File {}:\n{}", name, String::from_utf8_lossy(&bytes)),
            Err(e) => {
                warn!(file = %file_ref, error = %e, "Failed to read attachment");
                format!("File {} could not be parsed", name)
            }
        }
    }
}

/// Supplies standing guidance for every conversation
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn list_rules(&self) -> Vec<String>;
}

/// A fixed rule list
#[derive(Debug, Default, Clone)]
pub struct StaticRules(pub Vec<String>);

#[async_trait]
impl RuleSource for StaticRules {
    async fn list_rules(&self) -> Vec<String> {
        self.0.clone()
    }
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    content: String,
}

/// Rules kept in a `rules.json` array of `{id, content}` objects
#[derive(Debug, Clone)]
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleSource for JsonRuleStore {
    async fn list_rules(&self) -> Vec<String> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read rules");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<RuleEntry>>(&bytes) {
            Ok(entries) => entries
                .into_iter()
                .map(|entry| entry.content)
                .filter(|content| !content.trim().is_empty())
                .collect(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed rules file");
                Vec::new()
            }
        }
    }
}

/// Current chat limits, read once per `chat` call
pub trait SettingsSource: Send + Sync {
    fn chat_settings(&self) -> ChatSettings;
}

impl SettingsSource for ChatSettings {
    fn chat_settings(&self) -> ChatSettings {
        *self
    }
}

impl SettingsSource for parking_lot::RwLock<ChatSettings> {
    fn chat_settings(&self) -> ChatSettings {
        *self.read()
    }
}
