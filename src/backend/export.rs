//! Export-directory backend.
//!
//! Reads conversations that a chat service (or a separate export tool) has
//! dumped as JSON files, one file per conversation. The file path relative
//! to the account root, without extension, is the conversation's native id.
//!
//! ```json
//! {
//!   "name": "Weekend plans",
//!   "group": true,
//!   "contacts": [{ "id": "u1", "full_name": "Alice Example", "email": "alice@example.com" }],
//!   "messages": [
//!     { "id": "m1", "sender": "u1", "timestamp": "2018-08-02T10:15:00Z", "text": "hello", "html": "<b>hello</b>" },
//!     { "sender_label": "+31 6 1234", "timestamp": "2018-08-02T10:16:00Z", "text": "who is this?" }
//!   ]
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::ChatBackend;
use crate::config::{expand_home, AccountConfig};
use crate::error::BackendError;
use crate::models::{ContactInfo, ConversationDescriptor, MessageRecord};

#[derive(Debug, Deserialize, Default)]
struct ExportHeader {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    group: bool,
}

#[derive(Debug, Deserialize)]
struct ExportFile {
    #[serde(default)]
    contacts: Vec<ExportContact>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportContact {
    id: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    sender_label: Option<String>,
    timestamp: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: Option<String>,
}

#[derive(Debug)]
pub struct ExportBackend {
    root: PathBuf,
    include: GlobSet,
    files: Mutex<HashMap<String, PathBuf>>,
    contacts: Mutex<HashMap<String, ContactInfo>>,
}

impl ExportBackend {
    pub fn open(config: &AccountConfig) -> Result<Self, BackendError> {
        let root = config
            .path
            .as_deref()
            .map(expand_home)
            .ok_or_else(|| BackendError::Authentication("export path not configured".into()))?;

        if !root.is_dir() {
            return Err(BackendError::Authentication(format!(
                "export directory is not accessible: {}",
                root.display()
            )));
        }

        let include = build_globset(&config.include_globs)
            .map_err(|e| BackendError::Authentication(format!("invalid include_globs: {}", e)))?;

        Ok(Self {
            root,
            include,
            files: Mutex::new(HashMap::new()),
            contacts: Mutex::new(HashMap::new()),
        })
    }

    fn file_for(&self, external_id: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(external_id).cloned())
    }

    fn remember_contacts(&self, contacts: Vec<ExportContact>) {
        if let Ok(mut known) = self.contacts.lock() {
            for contact in contacts {
                known.insert(
                    contact.id,
                    ContactInfo {
                        full_name: contact.full_name.filter(|s| !s.trim().is_empty()),
                        email: contact.email.filter(|s| !s.trim().is_empty()),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl ChatBackend for ExportBackend {
    async fn list_conversations(
        &self,
        _watermarks: &HashMap<String, DateTime<Utc>>,
    ) -> Result<Vec<ConversationDescriptor>, BackendError> {
        let mut descriptors = Vec::new();
        let mut files = HashMap::new();

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                BackendError::Authentication(format!(
                    "failed to read export directory {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if !self.include.is_match(&rel_str) {
                continue;
            }

            let external_id = conversation_id(relative);
            // Unreadable files are still listed so their failure is recorded
            // on the conversation when it is fetched.
            let header = read_header(path).unwrap_or_else(|e| {
                warn!("Unreadable export file {}: {}", path.display(), e);
                ExportHeader::default()
            });

            descriptors.push(ConversationDescriptor {
                external_id: external_id.clone(),
                name: header.name.filter(|s| !s.trim().is_empty()),
                is_group: header.group,
                supports_incremental: true,
            });
            files.insert(external_id, path.to_path_buf());
        }

        // Sort for deterministic ordering
        descriptors.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        debug!(
            "Found {} conversation files in {}",
            descriptors.len(),
            self.root.display()
        );

        if let Ok(mut known) = self.files.lock() {
            *known = files;
        }
        Ok(descriptors)
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        let path = self.file_for(&conversation.external_id).ok_or_else(|| {
            BackendError::Conversation(format!(
                "no export file for conversation {}",
                conversation.external_id
            ))
        })?;

        let content = std::fs::read_to_string(&path).map_err(|e| {
            BackendError::Conversation(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: ExportFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::Conversation(format!("failed to parse {}: {}", path.display(), e))
        })?;

        self.remember_contacts(file.contacts);

        let mut records = Vec::with_capacity(file.messages.len());
        for message in file.messages {
            let timestamp = DateTime::parse_from_rfc3339(&message.timestamp)
                .map_err(|e| {
                    BackendError::Conversation(format!(
                        "malformed timestamp '{}' in {}: {}",
                        message.timestamp,
                        path.display(),
                        e
                    ))
                })?
                .with_timezone(&Utc);

            if let Some(since) = since {
                if timestamp <= since {
                    continue;
                }
            }

            records.push(MessageRecord {
                external_id: message.id.filter(|s| !s.is_empty()),
                sender_id: message.sender.filter(|s| !s.is_empty()),
                sender_placeholder: message.sender_label.filter(|s| !s.is_empty()),
                timestamp,
                text: message.text,
                html: message.html.filter(|s| !s.trim().is_empty()),
            });
        }

        Ok(records)
    }

    async fn resolve_contact(
        &self,
        external_id: &str,
    ) -> Result<Option<ContactInfo>, BackendError> {
        Ok(self
            .contacts
            .lock()
            .ok()
            .and_then(|known| known.get(external_id).cloned()))
    }
}

fn read_header(path: &Path) -> Result<ExportHeader> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Relative path without extension, always `/`-separated.
fn conversation_id(relative: &Path) -> String {
    relative
        .with_extension("")
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn account(root: &Path) -> AccountConfig {
        AccountConfig {
            path: Some(root.to_path_buf()),
            include_globs: vec!["**/*.json".to_string()],
        }
    }

    #[test]
    fn missing_directory_is_fatal() {
        let err = ExportBackend::open(&account(Path::new("/nonexistent/export"))).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn conversation_ids_use_forward_slashes() {
        assert_eq!(conversation_id(Path::new("team/general.json")), "team/general");
        assert_eq!(conversation_id(Path::new("alice.json")), "alice");
    }

    #[tokio::test]
    async fn lists_and_fetches_conversations() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("team")).unwrap();
        fs::write(
            tmp.path().join("team/general.json"),
            r#"{
                "name": "General",
                "group": true,
                "contacts": [{"id": "u1", "full_name": "Alice Example"}],
                "messages": [
                    {"id": "m1", "sender": "u1", "timestamp": "2018-08-02T10:15:00Z", "text": "hello"},
                    {"id": "m2", "sender": "u1", "timestamp": "2018-08-03T10:15:00Z", "text": "again"}
                ]
            }"#,
        )
        .unwrap();
        fs::write(tmp.path().join("notes.txt"), "not a conversation").unwrap();

        let backend = ExportBackend::open(&account(tmp.path())).unwrap();
        let conversations = backend.list_conversations(&HashMap::new()).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].external_id, "team/general");
        assert_eq!(conversations[0].name.as_deref(), Some("General"));
        assert!(conversations[0].is_group);

        let all = backend.fetch_messages(&conversations[0], None).await.unwrap();
        assert_eq!(all.len(), 2);

        let since = all[0].timestamp;
        let newer = backend
            .fetch_messages(&conversations[0], Some(since))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].external_id.as_deref(), Some("m2"));

        let alice = backend.resolve_contact("u1").await.unwrap().unwrap();
        assert_eq!(alice.full_name.as_deref(), Some("Alice Example"));
        assert!(backend.resolve_contact("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_file_fails_only_its_conversation() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("broken.json"), "{ not json").unwrap();
        fs::write(
            tmp.path().join("bad-time.json"),
            r#"{"messages": [{"timestamp": "yesterday", "text": "x"}]}"#,
        )
        .unwrap();

        let backend = ExportBackend::open(&account(tmp.path())).unwrap();
        let conversations = backend.list_conversations(&HashMap::new()).await.unwrap();
        assert_eq!(conversations.len(), 2);

        for conversation in &conversations {
            let err = backend.fetch_messages(conversation, None).await.unwrap_err();
            assert!(!err.is_fatal(), "{} should be isolated", conversation.external_id);
        }
    }
}
