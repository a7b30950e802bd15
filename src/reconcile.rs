//! Reconciliation engine.
//!
//! Merges one account's backend output into the archive:
//!
//! 1. upsert the conversation row,
//! 2. skip conversations flagged with a previous error (unless forced),
//! 3. fetch messages newer than the conversation's watermark,
//! 4. upsert senders and messages idempotently,
//! 5. advance the watermark in the same transaction as the inserts,
//! 6. record conversation-scoped failures and move on.
//!
//! Only failures that invalidate the whole account session (authentication,
//! connectivity, an unusable database) escape [`reconcile`]; everything else
//! ends up in the returned [`SyncReport`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::ChatBackend;
use crate::error::BackendError;
use crate::models::{
    from_millis, to_millis, AccountRef, ContactInfo, ConversationDescriptor, MessageRecord,
    TIMESTAMP_FORMAT,
};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

/// A conversation that failed during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationFailure {
    pub external_id: String,
    pub detail: String,
}

/// Outcome of reconciling one account (or, merged, several).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub conversations_added: u64,
    pub conversations_synced: u64,
    /// Skipped because of an error recorded by a previous run.
    pub conversations_skipped: u64,
    /// Failed during this run.
    pub conversations_failed: u64,
    /// Error flags cleared by a forced retry.
    pub conversations_retried: u64,
    pub messages_added: u64,
    pub contacts_added: u64,
    pub failures: Vec<ConversationFailure>,
    /// The run was asked to stop before it reached every conversation.
    pub stopped: bool,
}

impl SyncReport {
    pub fn merge(&mut self, other: &SyncReport) {
        self.conversations_added += other.conversations_added;
        self.conversations_synced += other.conversations_synced;
        self.conversations_skipped += other.conversations_skipped;
        self.conversations_failed += other.conversations_failed;
        self.conversations_retried += other.conversations_retried;
        self.messages_added += other.messages_added;
        self.contacts_added += other.contacts_added;
        self.failures.extend(other.failures.iter().cloned());
        self.stopped |= other.stopped;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Clear recorded conversation errors before syncing.
    pub force: bool,
    /// Checked before each conversation; set it to stop the run early.
    pub stop: Option<Arc<AtomicBool>>,
}

impl ReconcileOptions {
    pub fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

struct ConversationState {
    id: i64,
    watermark: Option<DateTime<Utc>>,
    import_error: bool,
}

#[derive(Default)]
struct ConversationOutcome {
    messages_added: u64,
    contacts_added: u64,
}

enum ConversationError {
    /// Abort the account.
    Fatal(BackendError),
    /// Record on the conversation and continue.
    Isolated(String),
}

impl From<BackendError> for ConversationError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Conversation(detail) => ConversationError::Isolated(detail),
            fatal => ConversationError::Fatal(fatal),
        }
    }
}

impl From<sqlx::Error> for ConversationError {
    fn from(e: sqlx::Error) -> Self {
        ConversationError::Isolated(format!("database error: {}", e))
    }
}

/// Contact row ids by native id, plus backend metadata fetched this run.
///
/// Ids created inside a conversation transaction stay pending until it
/// commits, so a rollback never leaves the cache pointing at missing rows.
#[derive(Default)]
struct ContactCache {
    committed: HashMap<String, i64>,
    pending: HashMap<String, i64>,
    metadata: HashMap<String, Option<ContactInfo>>,
}

impl ContactCache {
    fn get(&self, external_id: &str) -> Option<i64> {
        self.pending
            .get(external_id)
            .or_else(|| self.committed.get(external_id))
            .copied()
    }

    fn commit(&mut self) {
        self.committed.extend(self.pending.drain());
    }

    fn rollback(&mut self) {
        self.pending.clear();
    }
}

/// Reconcile one account's conversations into the archive.
pub async fn reconcile<B: ChatBackend + ?Sized>(
    pool: &SqlitePool,
    backend: &B,
    account: &AccountRef,
    options: &ReconcileOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let account_id = ensure_account(pool, account).await?;

    if options.force {
        report.conversations_retried = clear_errors(pool, account_id).await?;
        if report.conversations_retried > 0 {
            info!(
                "Retrying {} conversation(s) with previous synchronization errors",
                report.conversations_retried
            );
        }
    }

    progress.report(SyncProgressEvent::Connecting {
        account: account.clone(),
    });
    let watermarks = load_watermarks(pool, account_id).await?;
    let descriptors = backend
        .list_conversations(&watermarks)
        .await
        .with_context(|| format!("Failed to list conversations of {}", account))?;

    let total = descriptors.len() as u64;
    let mut contacts = ContactCache::default();

    for (n, descriptor) in descriptors.iter().enumerate() {
        if options.stop_requested() {
            warn!("Stopping {} before conversation {} of {}", account, n + 1, total);
            report.stopped = true;
            break;
        }
        progress.report(SyncProgressEvent::Conversation {
            account: account.clone(),
            n: n as u64 + 1,
            total,
        });

        let (state, created) = upsert_conversation(pool, account_id, descriptor).await?;
        if created {
            info!("Importing conversation {}", describe(descriptor));
            report.conversations_added += 1;
        }

        if state.import_error {
            debug!(
                "Skipping conversation {} with synchronization errors (use --force to retry)",
                descriptor.external_id
            );
            report.conversations_skipped += 1;
            continue;
        }

        match sync_conversation(pool, backend, account_id, &state, descriptor, &mut contacts).await
        {
            Ok(outcome) => {
                report.conversations_synced += 1;
                report.messages_added += outcome.messages_added;
                report.contacts_added += outcome.contacts_added;
            }
            Err(ConversationError::Fatal(e)) => {
                return Err(anyhow::Error::new(e).context(format!(
                    "Synchronization of {} aborted in conversation {}",
                    account, descriptor.external_id
                )));
            }
            Err(ConversationError::Isolated(detail)) => {
                warn!(
                    "Skipping conversation {} due to synchronization error: {}",
                    descriptor.external_id, detail
                );
                record_failure(pool, state.id, &detail).await?;
                report.conversations_failed += 1;
                report.failures.push(ConversationFailure {
                    external_id: descriptor.external_id.clone(),
                    detail,
                });
            }
        }
    }

    if report.conversations_skipped > 0 {
        warn!(
            "Skipped {} conversation(s) of {} due to previous synchronization errors (use --force to retry)",
            report.conversations_skipped, account
        );
    }
    info!(
        "Synchronized {}: {} conversation(s), {} new message(s), {} new contact(s)",
        account, report.conversations_synced, report.messages_added, report.contacts_added
    );

    Ok(report)
}

async fn sync_conversation<B: ChatBackend + ?Sized>(
    pool: &SqlitePool,
    backend: &B,
    account_id: i64,
    state: &ConversationState,
    descriptor: &ConversationDescriptor,
    contacts: &mut ContactCache,
) -> Result<ConversationOutcome, ConversationError> {
    let since = if descriptor.supports_incremental {
        state.watermark
    } else {
        None
    };
    let records = backend.fetch_messages(descriptor, since).await?;
    debug!(
        "Fetched {} message(s) of conversation {} (since {:?})",
        records.len(),
        descriptor.external_id,
        since
    );

    // Backend calls happen before the transaction opens.
    lookup_senders(pool, backend, account_id, &records, contacts).await?;

    let mut tx = pool.begin().await?;
    match write_batch(&mut tx, account_id, state.id, &records, contacts).await {
        Ok(outcome) => match tx.commit().await {
            Ok(()) => {
                contacts.commit();
                Ok(outcome)
            }
            Err(e) => {
                contacts.rollback();
                Err(e.into())
            }
        },
        Err(e) => {
            contacts.rollback();
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

/// Fetch backend metadata for senders that are new or still nameless.
async fn lookup_senders<B: ChatBackend + ?Sized>(
    pool: &SqlitePool,
    backend: &B,
    account_id: i64,
    records: &[MessageRecord],
    contacts: &mut ContactCache,
) -> Result<(), ConversationError> {
    let mut seen = HashSet::new();
    for external_id in records.iter().filter_map(|r| r.sender_id.as_deref()) {
        if !seen.insert(external_id)
            || contacts.get(external_id).is_some()
            || contacts.metadata.contains_key(external_id)
        {
            continue;
        }

        let stored_name: Option<Option<String>> = sqlx::query_scalar(
            "SELECT full_name FROM contacts WHERE account_id = ? AND external_id = ?",
        )
        .bind(account_id)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

        if let Some(Some(_)) = stored_name {
            continue;
        }

        let info = backend.resolve_contact(external_id).await?;
        if info.is_none() {
            debug!("Backend has no metadata for contact {}", external_id);
        }
        contacts.metadata.insert(external_id.to_string(), info);
    }
    Ok(())
}

async fn write_batch(
    conn: &mut SqliteConnection,
    account_id: i64,
    conversation_id: i64,
    records: &[MessageRecord],
    contacts: &mut ContactCache,
) -> Result<ConversationOutcome, ConversationError> {
    // Clearing the error flag first takes the write lock for the whole unit.
    sqlx::query("UPDATE conversations SET import_error = 0, error_detail = NULL WHERE id = ?")
        .bind(conversation_id)
        .execute(&mut *conn)
        .await?;

    let mut outcome = ConversationOutcome::default();
    let mut newest: Option<DateTime<Utc>> = None;

    for record in records {
        let sender_id = match record.sender_id.as_deref() {
            Some(external_id) => {
                Some(ensure_contact(conn, account_id, external_id, contacts, &mut outcome).await?)
            }
            None => None,
        };

        if insert_message(conn, conversation_id, sender_id, record).await? {
            outcome.messages_added += 1;
        }

        if newest.map_or(true, |ts| record.timestamp > ts) {
            newest = Some(record.timestamp);
        }
    }

    if let Some(newest) = newest {
        let ms = to_millis(&newest);
        sqlx::query(
            "UPDATE conversations SET last_modified = MAX(COALESCE(last_modified, ?), ?) WHERE id = ?",
        )
        .bind(ms)
        .bind(ms)
        .bind(conversation_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(outcome)
}

async fn ensure_contact(
    conn: &mut SqliteConnection,
    account_id: i64,
    external_id: &str,
    contacts: &mut ContactCache,
    outcome: &mut ConversationOutcome,
) -> Result<i64, ConversationError> {
    if let Some(id) = contacts.get(external_id) {
        return Ok(id);
    }

    let info = contacts
        .metadata
        .get(external_id)
        .cloned()
        .flatten()
        .unwrap_or_default();

    let mut existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM contacts WHERE account_id = ? AND external_id = ?")
            .bind(account_id)
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;

    if existing.is_none() {
        if let Some(email) = info.email.as_deref() {
            existing = sqlx::query_scalar(
                "SELECT id FROM contacts WHERE account_id = ? AND email = ? ORDER BY id LIMIT 1",
            )
            .bind(account_id)
            .bind(email)
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(id) = existing {
                debug!("Matched contact {} to #{} by email address", external_id, id);
            }
        }
    }

    let id = match existing {
        Some(id) => {
            // Only fill in what is missing; stored values are kept.
            sqlx::query(
                r#"
                UPDATE contacts SET
                    external_id = COALESCE(external_id, ?),
                    full_name = COALESCE(full_name, ?),
                    email = COALESCE(email, ?)
                WHERE id = ?
                "#,
            )
            .bind(external_id)
            .bind(&info.full_name)
            .bind(&info.email)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            id
        }
        None => {
            let id = sqlx::query(
                "INSERT INTO contacts (account_id, external_id, full_name, email) VALUES (?, ?, ?, ?)",
            )
            .bind(account_id)
            .bind(external_id)
            .bind(&info.full_name)
            .bind(&info.email)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
            info!(
                "Importing contact {}",
                info.full_name.as_deref().unwrap_or(external_id)
            );
            outcome.contacts_added += 1;
            id
        }
    };

    contacts.pending.insert(external_id.to_string(), id);
    Ok(id)
}

/// Insert a message unless its dedup key is already stored. Returns whether
/// a row was added.
async fn insert_message(
    conn: &mut SqliteConnection,
    conversation_id: i64,
    sender_id: Option<i64>,
    record: &MessageRecord,
) -> Result<bool, ConversationError> {
    let timestamp = to_millis(&record.timestamp);

    let fingerprint = match record.external_id.as_deref() {
        Some(external_id) => {
            let stored = sqlx::query(
                "SELECT timestamp, text FROM messages WHERE conversation_id = ? AND external_id = ?",
            )
            .bind(conversation_id)
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(row) = stored {
                let stored_timestamp: i64 = row.get("timestamp");
                let stored_text: String = row.get("text");
                if stored_timestamp != timestamp || stored_text != record.text {
                    return Err(ConversationError::Isolated(format!(
                        "message {} conflicts with the stored copy (stored {} {:?}, received {} {:?})",
                        external_id,
                        from_millis(stored_timestamp).format(TIMESTAMP_FORMAT),
                        stored_text,
                        record.timestamp.format(TIMESTAMP_FORMAT),
                        record.text
                    )));
                }
                return Ok(false);
            }
            None
        }
        None => {
            let fingerprint = record.fingerprint();
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM messages WHERE conversation_id = ? AND fingerprint = ?",
            )
            .bind(conversation_id)
            .bind(&fingerprint)
            .fetch_one(&mut *conn)
            .await?;
            if exists {
                return Ok(false);
            }
            Some(fingerprint)
        }
    };

    sqlx::query(
        r#"
        INSERT INTO messages (conversation_id, external_id, fingerprint, sender_id, sender_placeholder, timestamp, text, html)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(conversation_id)
    .bind(&record.external_id)
    .bind(&fingerprint)
    .bind(sender_id)
    .bind(if sender_id.is_none() {
        record.sender_placeholder.as_deref()
    } else {
        None
    })
    .bind(timestamp)
    .bind(&record.text)
    .bind(record.distinct_html())
    .execute(&mut *conn)
    .await?;

    debug!(
        "Importing message on {}: {}",
        record.timestamp.format(TIMESTAMP_FORMAT),
        record.text
    );
    Ok(true)
}

async fn ensure_account(pool: &SqlitePool, account: &AccountRef) -> Result<i64> {
    sqlx::query("INSERT INTO accounts (backend, name) VALUES (?, ?) ON CONFLICT(backend, name) DO NOTHING")
        .bind(&account.backend)
        .bind(&account.account)
        .execute(pool)
        .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM accounts WHERE backend = ? AND name = ?")
        .bind(&account.backend)
        .bind(&account.account)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

async fn clear_errors(pool: &SqlitePool, account_id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE conversations SET import_error = 0, error_detail = NULL WHERE account_id = ? AND import_error = 1",
    )
    .bind(account_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn load_watermarks(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<HashMap<String, DateTime<Utc>>> {
    let rows = sqlx::query(
        "SELECT external_id, last_modified FROM conversations WHERE account_id = ? AND last_modified IS NOT NULL",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let external_id: String = row.get("external_id");
            let last_modified: i64 = row.get("last_modified");
            (external_id, from_millis(last_modified))
        })
        .collect())
}

/// Create or refresh the conversation row. Returns whether it was created.
async fn upsert_conversation(
    pool: &SqlitePool,
    account_id: i64,
    descriptor: &ConversationDescriptor,
) -> Result<(ConversationState, bool)> {
    // One statement, so concurrent runs cannot both create the row.
    let created = sqlx::query(
        r#"
        INSERT INTO conversations (account_id, external_id, name, is_group) VALUES (?, ?, ?, ?)
        ON CONFLICT(account_id, external_id) DO NOTHING
        "#,
    )
    .bind(account_id)
    .bind(&descriptor.external_id)
    .bind(&descriptor.name)
    .bind(descriptor.is_group)
    .execute(pool)
    .await?
    .rows_affected()
        > 0;

    if !created {
        sqlx::query(
            "UPDATE conversations SET name = COALESCE(?, name), is_group = ? WHERE account_id = ? AND external_id = ?",
        )
        .bind(&descriptor.name)
        .bind(descriptor.is_group)
        .bind(account_id)
        .bind(&descriptor.external_id)
        .execute(pool)
        .await?;
    }

    let row = sqlx::query(
        "SELECT id, last_modified, import_error FROM conversations WHERE account_id = ? AND external_id = ?",
    )
    .bind(account_id)
    .bind(&descriptor.external_id)
    .fetch_one(pool)
    .await?;

    let last_modified: Option<i64> = row.get("last_modified");
    Ok((
        ConversationState {
            id: row.get("id"),
            watermark: last_modified.map(from_millis),
            import_error: row.get("import_error"),
        },
        created,
    ))
}

async fn record_failure(pool: &SqlitePool, conversation_id: i64, detail: &str) -> Result<()> {
    sqlx::query("UPDATE conversations SET import_error = 1, error_detail = ? WHERE id = ?")
        .bind(detail)
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn describe(descriptor: &ConversationDescriptor) -> String {
    match &descriptor.name {
        Some(name) => format!("{} ({})", descriptor.external_id, name),
        None => descriptor.external_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_contacts_are_dropped_on_rollback() {
        let mut cache = ContactCache::default();
        cache.pending.insert("u1".into(), 1);
        assert_eq!(cache.get("u1"), Some(1));
        cache.rollback();
        assert_eq!(cache.get("u1"), None);

        cache.pending.insert("u2".into(), 2);
        cache.commit();
        assert_eq!(cache.get("u2"), Some(2));
        cache.rollback();
        assert_eq!(cache.get("u2"), Some(2));
    }

    #[test]
    fn reports_merge_counts_and_failures() {
        let mut total = SyncReport::default();
        total.merge(&SyncReport {
            conversations_synced: 2,
            messages_added: 5,
            failures: vec![ConversationFailure {
                external_id: "a".into(),
                detail: "boom".into(),
            }],
            conversations_failed: 1,
            ..Default::default()
        });
        total.merge(&SyncReport {
            conversations_synced: 1,
            messages_added: 1,
            stopped: true,
            ..Default::default()
        });
        assert_eq!(total.conversations_synced, 3);
        assert_eq!(total.messages_added, 6);
        assert_eq!(total.conversations_failed, 1);
        assert_eq!(total.failures.len(), 1);
        assert!(total.stopped);
    }

    #[test]
    fn only_conversation_errors_are_isolated() {
        assert!(matches!(
            ConversationError::from(BackendError::Conversation("x".into())),
            ConversationError::Isolated(_)
        ));
        assert!(matches!(
            ConversationError::from(BackendError::Authentication("x".into())),
            ConversationError::Fatal(_)
        ));
    }
}
