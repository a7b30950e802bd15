//! Core data models used throughout chat-archive.
//!
//! Adapter records ([`ConversationDescriptor`], [`MessageRecord`],
//! [`ContactInfo`]) flow into the reconciliation engine; [`MessageView`] is
//! what the read path hands back.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::DEFAULT_ACCOUNT_NAME;

/// Canonical rendering of message timestamps, used for display and search.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A `(backend, account)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AccountRef {
    pub backend: String,
    pub account: String,
}

impl AccountRef {
    pub fn new(backend: impl Into<String>, account: impl Into<String>) -> Self {
        let account = account.into();
        Self {
            backend: backend.into(),
            account: if account.is_empty() {
                DEFAULT_ACCOUNT_NAME.to_string()
            } else {
                account
            },
        }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.account)
    }
}

/// A conversation as announced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDescriptor {
    pub external_id: String,
    pub name: Option<String>,
    pub is_group: bool,
    /// Whether `fetch_messages` honours the `since` watermark.
    pub supports_incremental: bool,
}

impl ConversationDescriptor {
    /// A two-party conversation that supports incremental fetches.
    pub fn private(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: None,
            is_group: false,
            supports_incremental: true,
        }
    }

    /// A named group conversation that supports incremental fetches.
    pub fn group(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: Some(name.into()),
            is_group: true,
            supports_incremental: true,
        }
    }

    /// Mark the conversation as requiring a full rescan on every run.
    pub fn full_rescan(mut self) -> Self {
        self.supports_incremental = false;
        self
    }
}

/// One message as produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub external_id: Option<String>,
    /// Native id of the sender; `None` when the backend could not tell.
    pub sender_id: Option<String>,
    /// Label distinguishing unknown senders from each other.
    pub sender_placeholder: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub html: Option<String>,
}

impl MessageRecord {
    pub fn new(
        external_id: Option<&str>,
        sender_id: Option<&str>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.map(str::to_string),
            sender_id: sender_id.map(str::to_string),
            sender_placeholder: None,
            timestamp,
            text: text.into(),
            html: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.sender_placeholder = Some(placeholder.into());
        self
    }

    /// The HTML body, unless it merely repeats the plain text.
    pub fn distinct_html(&self) -> Option<&str> {
        self.html.as_deref().filter(|html| *html != self.text)
    }

    /// Content fingerprint used as the dedup key when no native id exists.
    ///
    /// Built from the record itself rather than stored rows, so resolving an
    /// unknown sender later does not change the key of an ingested message.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(to_millis(&self.timestamp).to_le_bytes());
        hasher.update([0]);
        match (&self.sender_id, &self.sender_placeholder) {
            (Some(id), _) => {
                hasher.update(b"id:");
                hasher.update(id.as_bytes());
            }
            (None, Some(placeholder)) => {
                hasher.update(b"placeholder:");
                hasher.update(placeholder.as_bytes());
            }
            (None, None) => hasher.update(b"unknown"),
        }
        hasher.update([0]);
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Contact metadata served by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// A stored message joined with its conversation, account and sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub conversation_id: i64,
    pub backend: String,
    pub account: String,
    pub conversation_name: Option<String>,
    pub is_group: bool,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub sender_placeholder: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub html: Option<String>,
}

impl MessageView {
    pub fn rendered_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Sort key inside a conversation.
    pub fn position(&self) -> (i64, i64) {
        (to_millis(&self.timestamp), self.id)
    }
}

pub fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn empty_account_name_becomes_default() {
        let account = AccountRef::new("export", "");
        assert_eq!(account.account, "default");
        assert_eq!(account.to_string(), "export:default");
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = MessageRecord::new(None, Some("u1"), ts("2018-08-02T10:15:00Z"), "hi");
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other_sender = MessageRecord::new(None, Some("u2"), ts("2018-08-02T10:15:00Z"), "hi");
        assert_ne!(a.fingerprint(), other_sender.fingerprint());

        let other_time = MessageRecord::new(None, Some("u1"), ts("2018-08-02T10:15:01Z"), "hi");
        assert_ne!(a.fingerprint(), other_time.fingerprint());

        let unknown = MessageRecord::new(None, None, ts("2018-08-02T10:15:00Z"), "hi");
        let placeholder = unknown.clone().with_placeholder("u1");
        assert_ne!(unknown.fingerprint(), placeholder.fingerprint());
        assert_ne!(placeholder.fingerprint(), a.fingerprint());
    }

    #[test]
    fn html_repeating_the_text_is_dropped() {
        let plain = MessageRecord::new(None, None, ts("2018-08-02T10:15:00Z"), "hi").with_html("hi");
        assert_eq!(plain.distinct_html(), None);

        let rich = plain.clone().with_html("<b>hi</b>");
        assert_eq!(rich.distinct_html(), Some("<b>hi</b>"));
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let t = ts("2018-08-02T10:15:00.123Z");
        assert_eq!(from_millis(to_millis(&t)), t);
    }
}
