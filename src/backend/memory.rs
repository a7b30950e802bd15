//! In-memory backend with scripted conversations and failures.
//!
//! Useful for embedding the engine without a real service, and for
//! exercising the reconciliation paths that a live service only hits on a
//! bad day.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::ChatBackend;
use crate::error::BackendError;
use crate::models::{ContactInfo, ConversationDescriptor, MessageRecord};

#[derive(Debug, Clone)]
pub struct MemoryConversation {
    pub descriptor: ConversationDescriptor,
    pub messages: Vec<MessageRecord>,
    /// Returned by `fetch_messages` instead of the messages.
    pub failure: Option<BackendError>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    conversations: Vec<MemoryConversation>,
    contacts: HashMap<String, ContactInfo>,
    listing_failure: Option<BackendError>,
    fetches: Arc<Mutex<Vec<(String, Option<DateTime<Utc>>)>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation(
        mut self,
        descriptor: ConversationDescriptor,
        messages: Vec<MessageRecord>,
    ) -> Self {
        self.conversations.push(MemoryConversation {
            descriptor,
            messages,
            failure: None,
        });
        self
    }

    /// A conversation whose fetch fails with `failure`.
    pub fn with_failing_conversation(
        mut self,
        descriptor: ConversationDescriptor,
        failure: BackendError,
    ) -> Self {
        self.conversations.push(MemoryConversation {
            descriptor,
            messages: Vec::new(),
            failure: Some(failure),
        });
        self
    }

    pub fn with_contact(mut self, external_id: &str, info: ContactInfo) -> Self {
        self.contacts.insert(external_id.to_string(), info);
        self
    }

    /// Make `list_conversations` fail.
    pub fn with_listing_failure(mut self, failure: BackendError) -> Self {
        self.listing_failure = Some(failure);
        self
    }

    /// `(conversation, since)` of every `fetch_messages` call so far.
    pub fn fetches(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.fetches
            .lock()
            .map(|fetches| fetches.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn list_conversations(
        &self,
        _watermarks: &HashMap<String, DateTime<Utc>>,
    ) -> Result<Vec<ConversationDescriptor>, BackendError> {
        if let Some(failure) = &self.listing_failure {
            return Err(failure.clone());
        }
        Ok(self
            .conversations
            .iter()
            .map(|c| c.descriptor.clone())
            .collect())
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push((conversation.external_id.clone(), since));
        }

        let scripted = self
            .conversations
            .iter()
            .find(|c| c.descriptor.external_id == conversation.external_id)
            .ok_or_else(|| {
                BackendError::Conversation(format!(
                    "unknown conversation {}",
                    conversation.external_id
                ))
            })?;

        if let Some(failure) = &scripted.failure {
            return Err(failure.clone());
        }

        Ok(scripted
            .messages
            .iter()
            .filter(|m| since.map_or(true, |since| m.timestamp > since))
            .cloned()
            .collect())
    }

    async fn resolve_contact(
        &self,
        external_id: &str,
    ) -> Result<Option<ContactInfo>, BackendError> {
        Ok(self.contacts.get(external_id).cloned())
    }
}
