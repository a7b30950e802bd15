//! Backend adapters.
//!
//! Every chat service is reached through the [`ChatBackend`] capability
//! trait. The set of services is closed: [`Backend`] enumerates them and
//! delegates to the concrete adapter, so the orchestrator never deals with
//! open-ended trait objects. [`MemoryBackend`] implements the trait directly
//! for scripted runs against the engine.
//!
//! ```text
//! ┌───────────────┐  list_conversations   ┌──────────────┐
//! │    Backend    │──────────────────────▶│  reconcile   │
//! │    export     │  fetch_messages       │   (engine)   │
//! └───────────────┘  resolve_contact      └──────────────┘
//! ```

pub mod export;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::Config;
use crate::error::BackendError;
use crate::models::{AccountRef, ContactInfo, ConversationDescriptor, MessageRecord};

pub use export::ExportBackend;
pub use memory::{MemoryBackend, MemoryConversation};

/// Backend names accepted in configuration and selectors.
pub const BACKENDS: &[&str] = &["export"];

/// The operations the reconciliation engine needs from a chat service.
///
/// Every call is an await point; the engine never holds a database
/// transaction across one.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// List the conversations of the account.
    ///
    /// `watermarks` maps native conversation ids to the newest stored
    /// message, letting a backend skip conversations without news.
    async fn list_conversations(
        &self,
        watermarks: &HashMap<String, DateTime<Utc>>,
    ) -> Result<Vec<ConversationDescriptor>, BackendError>;

    /// Fetch messages of one conversation strictly newer than `since`, or
    /// every message when `since` is `None`.
    async fn fetch_messages(
        &self,
        conversation: &ConversationDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, BackendError>;

    /// Look up metadata for a native contact id. `Ok(None)` means the
    /// backend does not know the contact.
    async fn resolve_contact(&self, external_id: &str)
        -> Result<Option<ContactInfo>, BackendError>;
}

/// A session with one of the supported services.
#[derive(Debug)]
pub enum Backend {
    Export(ExportBackend),
}

impl Backend {
    /// Establish a session for a configured account.
    pub async fn open(account: &AccountRef, config: &Config) -> Result<Self, BackendError> {
        let account_config = config.account(account).ok_or_else(|| {
            BackendError::Authentication(format!("account {} is not configured", account))
        })?;

        match account.backend.as_str() {
            "export" => Ok(Backend::Export(ExportBackend::open(account_config)?)),
            other => Err(BackendError::Authentication(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl ChatBackend for Backend {
    async fn list_conversations(
        &self,
        watermarks: &HashMap<String, DateTime<Utc>>,
    ) -> Result<Vec<ConversationDescriptor>, BackendError> {
        match self {
            Backend::Export(b) => b.list_conversations(watermarks).await,
        }
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationDescriptor,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        match self {
            Backend::Export(b) => b.fetch_messages(conversation, since).await,
        }
    }

    async fn resolve_contact(
        &self,
        external_id: &str,
    ) -> Result<Option<ContactInfo>, BackendError> {
        match self {
            Backend::Export(b) => b.resolve_contact(external_id).await,
        }
    }
}
