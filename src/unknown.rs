//! Unknown-sender resolution.
//!
//! Messages whose sender could not be identified at ingest time are stored
//! with a null sender and, when the backend offered one, a placeholder label.
//! In a private conversation with a single unknown placeholder, the user can
//! name that sender after the fact: a new contact is created and the
//! placeholder messages are pointed at it.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::error::ResolveError;
use crate::migrate;
use crate::render;
use crate::search;

/// A conversation with messages from an unidentified sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedSender {
    pub conversation_id: i64,
    pub backend: String,
    pub account: String,
    pub conversation_name: Option<String>,
    pub is_group: bool,
    pub placeholder: Option<String>,
    pub message_count: i64,
}

/// Every `(conversation, placeholder)` pair with unresolved messages.
pub async fn list_unresolved(pool: &SqlitePool) -> Result<Vec<UnresolvedSender>> {
    let rows = sqlx::query(
        r#"
        SELECT
            c.id AS conversation_id,
            a.backend,
            a.name AS account,
            c.name AS conversation_name,
            c.is_group,
            m.sender_placeholder,
            COUNT(*) AS message_count
        FROM messages m
        JOIN conversations c ON c.id = m.conversation_id
        JOIN accounts a ON a.id = c.account_id
        WHERE m.sender_id IS NULL
        GROUP BY c.id, m.sender_placeholder
        ORDER BY c.id, m.sender_placeholder
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| UnresolvedSender {
            conversation_id: row.get("conversation_id"),
            backend: row.get("backend"),
            account: row.get("account"),
            conversation_name: row.get("conversation_name"),
            is_group: row.get("is_group"),
            placeholder: row.get("sender_placeholder"),
            message_count: row.get("message_count"),
        })
        .collect())
}

/// Attach a new contact named `full_name` to the unknown sender of a private
/// conversation. Returns the number of messages updated; zero when nothing
/// is left to resolve.
///
/// Runs in one transaction; a rejection leaves the archive untouched.
pub async fn resolve(
    pool: &SqlitePool,
    conversation_id: i64,
    full_name: &str,
) -> Result<u64, ResolveError> {
    let full_name = full_name.trim();
    if full_name.is_empty() {
        return Err(ResolveError::NoName);
    }

    let mut tx = pool.begin().await?;

    // A write before any read takes the lock up front, so a sync committing
    // meanwhile cannot invalidate this transaction's snapshot.
    let touched = sqlx::query("UPDATE conversations SET is_group = is_group WHERE id = ?")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(ResolveError::NotFound(conversation_id));
    }

    let conversation = sqlx::query("SELECT account_id, is_group FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

    let is_group: bool = conversation.get("is_group");
    if is_group {
        return Err(ResolveError::GroupConversation(conversation_id));
    }
    let account_id: i64 = conversation.get("account_id");

    // A null placeholder counts as one identity of its own.
    let placeholders: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT DISTINCT sender_placeholder FROM messages WHERE conversation_id = ? AND sender_id IS NULL",
    )
    .bind(conversation_id)
    .fetch_all(&mut *tx)
    .await?;

    match placeholders.len() {
        0 => return Ok(0),
        1 => {}
        n => return Err(ResolveError::Ambiguous(conversation_id, n)),
    }

    let contact_id = sqlx::query("INSERT INTO contacts (account_id, full_name) VALUES (?, ?)")
        .bind(account_id)
        .bind(full_name)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

    let updated = sqlx::query(
        "UPDATE messages SET sender_id = ? WHERE conversation_id = ? AND sender_id IS NULL",
    )
    .bind(contact_id)
    .bind(conversation_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    info!(
        "Resolved {} message(s) of conversation {} to {}",
        updated, conversation_id, full_name
    );
    Ok(updated)
}

/// Recent messages shown for each private conversation in `unknown`.
const SAMPLE_MESSAGES: i64 = 10;

/// Run `unknown`: list conversations with unresolved senders, with a sample
/// of recent messages from each private one to help name the sender.
pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let unresolved = list_unresolved(&pool).await?;

    if unresolved.is_empty() {
        pool.close().await;
        println!("No unknown senders.");
        return Ok(());
    }

    println!(
        "{:<8} {:<20} {:<30} {:<20} {:>8}",
        "ID", "ACCOUNT", "CONVERSATION", "PLACEHOLDER", "MESSAGES"
    );
    for u in &unresolved {
        let name = match (&u.conversation_name, u.is_group) {
            (Some(name), true) => format!("{} (group)", name),
            (Some(name), false) => name.clone(),
            (None, true) => "(group)".to_string(),
            (None, false) => "-".to_string(),
        };
        println!(
            "{:<8} {:<20} {:<30} {:<20} {:>8}",
            u.conversation_id,
            format!("{}:{}", u.backend, u.account),
            name,
            u.placeholder.as_deref().unwrap_or("?"),
            u.message_count
        );
    }

    let mut shown = HashSet::new();
    for u in unresolved.iter().filter(|u| !u.is_group) {
        if !shown.insert(u.conversation_id) {
            continue;
        }
        let sample =
            search::conversation_messages(&pool, u.conversation_id, SAMPLE_MESSAGES).await?;
        if let Some(first) = sample.first() {
            println!();
            println!("{}", render::conversation_header(first));
            for message in &sample {
                println!("  {}", render::message_line(message));
            }
        }
    }

    pool.close().await;
    Ok(())
}

/// Run `unknown resolve ID NAME...`.
pub async fn run_resolve(config: &Config, conversation_id: i64, full_name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let result = resolve(&pool, conversation_id, full_name).await;
    pool.close().await;

    match result? {
        0 => println!("Nothing to resolve in conversation {}.", conversation_id),
        n => println!(
            "Resolved {} message(s) in conversation {} to {}.",
            n,
            conversation_id,
            full_name.trim()
        ),
    }
    Ok(())
}
