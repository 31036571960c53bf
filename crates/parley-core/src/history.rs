//! Session history storage
//!
//! One JSON record per session at `<dir>/<session_id>.json`, shaped as
//! `{ "createdTime": ..., "messages": [...] }`. Appends are serialized per
//! session id and land via write-then-rename, so readers never see a torn file.

use std::collections::HashMap;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{Message, Session};

/// On-disk shape of a session file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    #[serde(default = "Utc::now")]
    created_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "skip_null_messages")]
    messages: Vec<Message>,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            created_time: Utc::now(),
            messages: Vec::new(),
        }
    }

    fn into_session(self, session_id: String) -> Session {
        Session {
            session_id,
            created_time: self.created_time,
            messages: self.messages,
        }
    }
}

fn skip_null_messages<'de, D>(deserializer: D) -> std::result::Result<Vec<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Option<Message>>> = Option::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default().into_iter().flatten().collect())
}

/// File-backed, per-session message log
pub struct SessionStore {
    dir: PathBuf,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create an empty session record if none exists yet
    pub async fn create(&self, session_id: &str) -> Result<()> {
        self.append(session_id, None).await
    }

    /// Append a message, creating the session file on first use
    pub async fn append(&self, session_id: &str, message: Option<&Message>) -> Result<()> {
        let path = self.session_path(session_id)?;
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.write_appended(&path, message).await
        };
        self.release_lock(session_id, lock);

        let count = result?;
        debug!(session_id, messages = count, "Session appended");
        Ok(())
    }

    async fn write_appended(&self, path: &Path, message: Option<&Message>) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut record = read_record(path).await?.unwrap_or_else(SessionRecord::new);
        if let Some(message) = message {
            record.messages.push(message.clone());
        }
        write_record(path, &record).await?;
        Ok(record.messages.len())
    }

    /// The first `limit` messages of the session log, oldest first.
    ///
    /// The record is stream-decoded; messages past `limit` are skipped without
    /// being kept.
    pub async fn bounded_slice(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let path = self.session_path(session_id)?;
        tokio::task::spawn_blocking(move || read_leading_messages(&path, limit))
            .await
            .map_err(|e| Error::Storage(format!("History reader failed: {}", e)))?
    }

    /// Load a whole session
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(session_id)?;
        Ok(read_record(&path)
            .await?
            .map(|record| record.into_session(session_id.to_string())))
    }

    /// Every stored session, newest `createdTime` first. Unreadable files are
    /// logged and skipped.
    pub async fn list_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for (session_id, path) in self.session_files().await? {
            match read_record(&path).await {
                Ok(Some(record)) => sessions.push(record.into_session(session_id)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read session"),
            }
        }

        sessions.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(sessions)
    }

    /// Delete one session. Returns whether a record existed.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.session_path(session_id)?;
        let lock = self.lock_for(session_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        };
        self.release_lock(session_id, lock);
        removed
    }

    /// Delete every session. Returns how many records were removed.
    pub async fn delete_all(&self) -> Result<usize> {
        let mut count = 0;
        for (session_id, _) in self.session_files().await? {
            if self.delete(&session_id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the table entry once no other task holds or waits on it.
    fn release_lock(&self, session_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock();
        if locks.get(session_id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(session_id);
        }
    }

        async fn session_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    files.push((stem.to_string(), path.clone()));
                }
            }
        }
        Ok(files)
    }
}

/// Session ids become file names, so anything that could escape the
/// history directory is rejected.
pub(crate) fn validate_session_id(session_id: &str) -> Result<()> {
    let bad = session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn read_record(path: &Path) -> Result<Option<SessionRecord>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
    Ok(Some(record))
}

async fn write_record(path: &Path, record: &SessionRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn read_leading_messages(path: &Path, limit: usize) -> Result<Vec<Message>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    LeadingMessages { limit }
        .deserialize(&mut deserializer)
        .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))
}

/// Decodes a session record, keeping only the first `limit` messages
struct LeadingMessages {
    limit: usize,
}

impl<'de> DeserializeSeed<'de> for LeadingMessages {
    type Value = Vec<Message>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for LeadingMessages {
    type Value = Vec<Message>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a session record")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut messages = Vec::new();
        while let Some(key) = map.next_key::<String>()? {
            if key == "messages" {
                messages = map.next_value_seed(FirstMessages { limit: self.limit })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(messages)
    }
}

struct FirstMessages {
    limit: usize,
}

impl<'de> DeserializeSeed<'de> for FirstMessages {
    type Value = Vec<Message>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for FirstMessages {
    type Value = Vec<Message>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of messages")
    }

    fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(Vec::new())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut messages = Vec::with_capacity(self.limit.min(64));
        while messages.len() < self.limit {
            match seq.next_element::<Option<Message>>()? {
                Some(Some(message)) => messages.push(message),
                Some(None) => continue,
                None => return Ok(messages),
            }
        }
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(messages)
    }
}
