//! Archive statistics.
//!
//! A quick summary of what the archive holds: contact, conversation and
//! message counts, storage sizes, conversations waiting for a forced retry,
//! and a per-account breakdown. Used by `chat-archive stats` to give
//! confidence that syncs are working as expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::from_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub backend: String,
    pub account: String,
    pub conversations: i64,
    pub messages: i64,
    pub failed_conversations: i64,
    /// Newest watermark of the account, in milliseconds.
    pub last_message_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub contacts: i64,
    pub conversations: i64,
    pub messages: i64,
    pub html_messages: i64,
    pub failed_conversations: i64,
    pub database_bytes: u64,
    pub text_bytes: i64,
    pub html_bytes: i64,
    pub accounts: Vec<AccountStats>,
}

/// Gather statistics. `database_path` is only used for the file size.
pub async fn collect_stats(pool: &SqlitePool, database_path: &Path) -> Result<ArchiveStats> {
    let contacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
        .fetch_one(pool)
        .await?;

    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(pool)
        .await?;

    let failed_conversations: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE import_error = 1")
            .fetch_one(pool)
            .await?;

    let totals = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS messages,
            COUNT(html) AS html_messages,
            COALESCE(SUM(LENGTH(CAST(text AS BLOB))), 0) AS text_bytes,
            COALESCE(SUM(LENGTH(CAST(html AS BLOB))), 0) AS html_bytes
        FROM messages
        "#,
    )
    .fetch_one(pool)
    .await?;

    let account_rows = sqlx::query(
        r#"
        SELECT
            a.backend,
            a.name AS account,
            (SELECT COUNT(*) FROM conversations c WHERE c.account_id = a.id) AS conversations,
            (SELECT COUNT(*) FROM messages m JOIN conversations c ON c.id = m.conversation_id
                WHERE c.account_id = a.id) AS messages,
            (SELECT COUNT(*) FROM conversations c WHERE c.account_id = a.id AND c.import_error = 1)
                AS failed_conversations,
            (SELECT MAX(c.last_modified) FROM conversations c WHERE c.account_id = a.id)
                AS last_message_ms
        FROM accounts a
        ORDER BY a.backend, a.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let database_bytes = std::fs::metadata(database_path)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(ArchiveStats {
        contacts,
        conversations,
        messages: totals.get("messages"),
        html_messages: totals.get("html_messages"),
        failed_conversations,
        database_bytes,
        text_bytes: totals.get("text_bytes"),
        html_bytes: totals.get("html_bytes"),
        accounts: account_rows
            .iter()
            .map(|row| AccountStats {
                backend: row.get("backend"),
                account: row.get("account"),
                conversations: row.get("conversations"),
                messages: row.get("messages"),
                failed_conversations: row.get("failed_conversations"),
                last_message_ms: row.get("last_message_ms"),
            })
            .collect(),
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let database_path = config.database_path();
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let stats = collect_stats(&pool, &database_path).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Chat Archive Database Stats");
    println!("===========================");
    println!();
    println!("  Database:       {}", database_path.display());
    println!("  Size:           {}", format_bytes(stats.database_bytes));
    println!();
    println!("  Contacts:       {}", stats.contacts);
    println!("  Conversations:  {}", stats.conversations);
    println!("  Messages:       {}", stats.messages);
    println!("  HTML messages:  {}", stats.html_messages);
    println!("  Text size:      {}", format_bytes(stats.text_bytes as u64));
    println!("  HTML size:      {}", format_bytes(stats.html_bytes as u64));
    if stats.failed_conversations > 0 {
        println!(
            "  Failed:         {} (use `sync --force` to retry)",
            stats.failed_conversations
        );
    }

    if !stats.accounts.is_empty() {
        println!();
        println!("  By account:");
        println!(
            "  {:<28} {:>8} {:>10} {:>7}   {}",
            "ACCOUNT", "CONVS", "MESSAGES", "FAILED", "NEWEST MESSAGE"
        );
        println!("  {}", "-".repeat(76));

        for a in &stats.accounts {
            let newest = match a.last_message_ms {
                Some(ms) => format_ts_relative(from_millis(ms).timestamp()),
                None => "never".to_string(),
            };
            println!(
                "  {:<28} {:>8} {:>10} {:>7}   {}",
                format!("{}:{}", a.backend, a.account),
                a.conversations,
                a.messages,
                a.failed_conversations,
                newest
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
