//! Keyword search with conversational context.
//!
//! A message matches when every keyword occurs, case-insensitively, in at
//! least one of: backend, account, conversation name, sender name, sender
//! email, the rendered timestamp (`YYYY-MM-DD HH:MM:SS`, UTC), the text or
//! the HTML body. Timestamp matching is plain substring containment, which is
//! why `2018-08` finds every message of August 2018.
//!
//! Each hit is widened to a window of up to `context` messages on either
//! side within its conversation. Windows are computed with indexed
//! `(timestamp, id)` range queries, sorted per conversation and coalesced in
//! one linear pass when they overlap or touch, so the surrounding
//! conversation reads as one block and no message is printed twice.

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{from_millis, MessageView};
use crate::render;

const MESSAGE_SELECT: &str = r#"
    SELECT
        m.id,
        m.conversation_id,
        a.backend,
        a.name AS account,
        c.name AS conversation_name,
        c.is_group,
        s.full_name AS sender_name,
        s.email AS sender_email,
        m.sender_placeholder,
        m.timestamp,
        m.text,
        m.html
    FROM messages m
    JOIN conversations c ON c.id = m.conversation_id
    JOIN accounts a ON a.id = c.account_id
    LEFT JOIN contacts s ON s.id = m.sender_id
"#;

/// Fields each keyword is matched against; one bind per field.
const KEYWORD_FIELDS: &[&str] = &[
    "a.backend",
    "a.name",
    "c.name",
    "s.full_name",
    "s.email",
    // Floor division, matching how pre-1970 timestamps are rendered.
    "strftime('%Y-%m-%d %H:%M:%S', (m.timestamp - ((m.timestamp % 1000) + 1000) % 1000) / 1000, 'unixepoch')",
    "m.text",
    "m.html",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMessage {
    #[serde(flatten)]
    pub message: MessageView,
    /// Whether this message matched, as opposed to being context.
    pub is_match: bool,
}

/// A contiguous run of messages from one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultGroup {
    pub conversation_id: i64,
    /// Messages of the same conversation between the previous group and
    /// this one; `None` for the conversation's first group.
    pub omitted_before: Option<u64>,
    pub messages: Vec<GroupMessage>,
}

type Position = (i64, i64);

struct Window {
    conversation_id: i64,
    start: Position,
    end: Position,
    /// First message after `end`, used to detect touching windows.
    next: Option<Position>,
    hits: Vec<i64>,
}

/// Search the archive. Blank keywords are ignored; no keywords, no results.
///
/// Runs inside one read transaction so a concurrent sync is never seen
/// half-committed.
pub async fn search_messages(
    pool: &SqlitePool,
    keywords: &[String],
    context: usize,
) -> Result<Vec<ResultGroup>> {
    let keywords: Vec<&str> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await?;

    let hits = fetch_hits(&mut tx, &keywords).await?;
    if hits.is_empty() {
        tx.commit().await?;
        return Ok(Vec::new());
    }

    let mut groups = if context == 0 {
        hits.into_iter()
            .map(|message| ResultGroup {
                conversation_id: message.conversation_id,
                omitted_before: None,
                messages: vec![GroupMessage {
                    message,
                    is_match: true,
                }],
            })
            .collect::<Vec<_>>()
    } else {
        let windows = coalesce(context_windows(&mut tx, &hits, context).await?);
        let mut groups = Vec::with_capacity(windows.len());
        for window in &windows {
            groups.push(read_window(&mut tx, window).await?);
        }
        groups
    };

    count_omitted(&mut tx, &mut groups).await?;
    tx.commit().await?;

    groups.sort_by_key(|g| {
        g.messages
            .first()
            .map(|m| (m.message.position(), g.conversation_id))
    });
    Ok(groups)
}

/// Every stored message, oldest first.
pub async fn list_messages(pool: &SqlitePool) -> Result<Vec<MessageView>> {
    let sql = format!("{} ORDER BY m.timestamp, m.id", MESSAGE_SELECT);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(message_from_row).collect())
}

/// The newest `limit` messages of one conversation, oldest first.
pub async fn conversation_messages(
    pool: &SqlitePool,
    conversation_id: i64,
    limit: i64,
) -> Result<Vec<MessageView>> {
    let sql = format!(
        "{} WHERE m.conversation_id = ? ORDER BY m.timestamp DESC, m.id DESC LIMIT ?",
        MESSAGE_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    let mut messages: Vec<MessageView> = rows.iter().map(message_from_row).collect();
    messages.reverse();
    Ok(messages)
}

async fn fetch_hits(conn: &mut SqliteConnection, keywords: &[&str]) -> Result<Vec<MessageView>> {
    let per_keyword = KEYWORD_FIELDS
        .iter()
        .map(|field| format!(r"{} LIKE ? ESCAPE '\'", field))
        .collect::<Vec<_>>()
        .join(" OR ");
    let clauses = vec![format!("({})", per_keyword); keywords.len()];
    let sql = format!(
        "{} WHERE {} ORDER BY m.conversation_id, m.timestamp, m.id",
        MESSAGE_SELECT,
        clauses.join(" AND ")
    );

    let mut query = sqlx::query(&sql);
    for keyword in keywords {
        let pattern = format!("%{}%", escape_like(keyword));
        for _ in KEYWORD_FIELDS {
            query = query.bind(pattern.clone());
        }
    }

    let rows = query.fetch_all(&mut *conn).await?;
    Ok(rows.iter().map(message_from_row).collect())
}

/// One window per hit, in `(conversation, timestamp, id)` order.
async fn context_windows(
    conn: &mut SqliteConnection,
    hits: &[MessageView],
    context: usize,
) -> Result<Vec<Window>> {
    let mut windows = Vec::with_capacity(hits.len());

    for hit in hits {
        let (ts, id) = hit.position();

        let before: Vec<Position> = sqlx::query_as(
            r#"
            SELECT timestamp, id FROM messages
            WHERE conversation_id = ? AND (timestamp, id) < (?, ?)
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(hit.conversation_id)
        .bind(ts)
        .bind(id)
        .bind(context as i64)
        .fetch_all(&mut *conn)
        .await?;

        // One extra row tells where the next message starts.
        let after: Vec<Position> = sqlx::query_as(
            r#"
            SELECT timestamp, id FROM messages
            WHERE conversation_id = ? AND (timestamp, id) > (?, ?)
            ORDER BY timestamp, id
            LIMIT ?
            "#,
        )
        .bind(hit.conversation_id)
        .bind(ts)
        .bind(id)
        .bind(context as i64 + 1)
        .fetch_all(&mut *conn)
        .await?;

        let start = before.last().copied().unwrap_or((ts, id));
        let end = after
            .iter()
            .take(context)
            .last()
            .copied()
            .unwrap_or((ts, id));

        windows.push(Window {
            conversation_id: hit.conversation_id,
            start,
            end,
            next: after.get(context).copied(),
            hits: vec![hit.id],
        });
    }

    Ok(windows)
}

/// Merge overlapping or touching windows. Input must be sorted by
/// conversation and start.
fn coalesce(windows: Vec<Window>) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::with_capacity(windows.len());
    for window in windows {
        if let Some(last) = merged.last_mut() {
            let joins = last.conversation_id == window.conversation_id
                && (window.start <= last.end || Some(window.start) == last.next);
            if joins {
                if window.end > last.end {
                    last.end = window.end;
                    last.next = window.next;
                }
                last.hits.extend(window.hits);
                continue;
            }
        }
        merged.push(window);
    }
    merged
}

async fn read_window(conn: &mut SqliteConnection, window: &Window) -> Result<ResultGroup> {
    let sql = format!(
        "{} WHERE m.conversation_id = ? AND (m.timestamp, m.id) >= (?, ?) AND (m.timestamp, m.id) <= (?, ?) ORDER BY m.timestamp, m.id",
        MESSAGE_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(window.conversation_id)
        .bind(window.start.0)
        .bind(window.start.1)
        .bind(window.end.0)
        .bind(window.end.1)
        .fetch_all(&mut *conn)
        .await?;

    let hits: HashSet<i64> = window.hits.iter().copied().collect();
    Ok(ResultGroup {
        conversation_id: window.conversation_id,
        omitted_before: None,
        messages: rows
            .iter()
            .map(|row| {
                let message = message_from_row(row);
                let is_match = hits.contains(&message.id);
                GroupMessage { message, is_match }
            })
            .collect(),
    })
}

/// Fill `omitted_before` for every group after a conversation's first.
/// Groups must still be in `(conversation, position)` order.
async fn count_omitted(conn: &mut SqliteConnection, groups: &mut [ResultGroup]) -> Result<()> {
    let mut previous: Option<(i64, Position)> = None;
    for group in groups.iter_mut() {
        let (Some(first), Some(last)) = (group.messages.first(), group.messages.last()) else {
            continue;
        };
        let (first, last) = (first.message.position(), last.message.position());

        if let Some((conversation_id, prev_end)) = previous {
            if conversation_id == group.conversation_id {
                let omitted: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM messages
                    WHERE conversation_id = ? AND (timestamp, id) > (?, ?) AND (timestamp, id) < (?, ?)
                    "#,
                )
                .bind(group.conversation_id)
                .bind(prev_end.0)
                .bind(prev_end.1)
                .bind(first.0)
                .bind(first.1)
                .fetch_one(&mut *conn)
                .await?;
                group.omitted_before = Some(omitted as u64);
            }
        }
        previous = Some((group.conversation_id, last));
    }
    Ok(())
}

fn message_from_row(row: &SqliteRow) -> MessageView {
    MessageView {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        backend: row.get("backend"),
        account: row.get("account"),
        conversation_name: row.get("conversation_name"),
        is_group: row.get("is_group"),
        sender_name: row.get("sender_name"),
        sender_email: row.get("sender_email"),
        sender_placeholder: row.get("sender_placeholder"),
        timestamp: from_millis(row.get("timestamp")),
        text: row.get("text"),
        html: row.get("html"),
    }
}

/// Escape `LIKE` wildcards so keywords match literally.
fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Run the `search` command.
pub async fn run_search(
    config: &Config,
    keywords: &[String],
    context: Option<usize>,
    json: bool,
) -> Result<()> {
    let context = context.unwrap_or(config.search.context);
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let groups = search_messages(&pool, keywords, context).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print!("{}", render::render_groups(&groups));
    println!();
    println!("{}", render::render_summary(&groups));
    Ok(())
}

/// Run the `list` command.
pub async fn run_list(config: &Config, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let messages = list_messages(&pool).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    let mut current: Option<i64> = None;
    for message in &messages {
        if current != Some(message.conversation_id) {
            println!("{}", render::conversation_header(message));
            current = Some(message.conversation_id);
        }
        println!("{}", render::message_line(message));
    }
    Ok(())
}
