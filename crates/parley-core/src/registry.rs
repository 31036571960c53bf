//! Tool server registry
//!
//! The user-editable `mcp.json` document listing which tool servers exist and
//! how to reach them. Every successful `replace` bumps the revision, which is
//! what the connection manager keys its cache on.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// How a tool server is reached, as written by the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Executable to spawn for a process server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Endpoint of a network server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Fixed headers sent with every network request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Transport chosen for a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Process,
    Network,
}

impl ServerSpec {
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::default()
        }
    }

    pub fn network(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// A command wins over a URL; a spec with neither cannot be connected.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        if self.command.as_deref().is_some_and(|c| !c.is_empty()) {
            Some(TransportKind::Process)
        } else if self.url.as_deref().is_some_and(|u| !u.is_empty()) {
            Some(TransportKind::Network)
        } else {
            None
        }
    }
}

/// The whole registry document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(rename = "mcpServers", alias = "servers", default)]
    pub servers: BTreeMap<String, ServerSpec>,
}

impl RegistryDocument {
    /// Parse a document; only the overall shape is checked
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Registry(format!("Invalid registry document: {}", e)))
    }

    pub fn with_server(mut self, id: impl Into<String>, spec: ServerSpec) -> Self {
        self.servers.insert(id.into(), spec);
        self
    }
}

/// File-backed registry of tool servers
pub struct ToolServerRegistry {
    path: PathBuf,
    document: RwLock<RegistryDocument>,
    revision: AtomicU64,
}

impl ToolServerRegistry {
    /// Load the registry at `path`, writing an empty document if none exists.
    /// A document that cannot be read or parsed is treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            Self::load(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable tool server registry");
                RegistryDocument::default()
            })
        } else {
            let document = RegistryDocument::default();
            Self::write_sync(&path, &document)?;
            document
        };

        Ok(Self {
            path,
            document: RwLock::new(document),
            revision: AtomicU64::new(1),
        })
    }

    /// An unpersisted registry, for tests and embedding
    pub fn in_memory(document: RegistryDocument) -> Self {
        Self {
            path: PathBuf::new(),
            document: RwLock::new(document),
            revision: AtomicU64::new(1),
        }
    }

    fn load(path: &Path) -> Result<RegistryDocument> {
        let text = std::fs::read_to_string(path)?;
        RegistryDocument::from_json(&text)
    }

    fn write_sync(path: &Path, document: &RegistryDocument) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(document)?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> RegistryDocument {
        self.document.read().clone()
    }

    /// Pretty-printed document, for editing
    pub fn get_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.document.read())?)
    }

    pub fn spec(&self, id: &str) -> Option<ServerSpec> {
        self.document.read().servers.get(id).cloned()
    }

    /// Current revision; changes after every `replace`
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Persist a new document and invalidate cached connections
    pub async fn replace(&self, document: RegistryDocument) -> Result<()> {
        if !self.path.as_os_str().is_empty() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = self.path.with_extension("json.tmp");
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&document)?).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
        }

        let servers = document.servers.len();
        *self.document.write() = document;
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        info!(servers, revision, "Tool server registry replaced");
        Ok(())
    }

    /// Parse and replace in one step
    pub async fn replace_json(&self, text: &str) -> Result<()> {
        let document = RegistryDocument::from_json(text)?;
        self.replace(document).await
    }
}
