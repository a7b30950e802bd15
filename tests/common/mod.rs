#![allow(dead_code)]

use chat_archive::backend::MemoryBackend;
use chat_archive::models::AccountRef;
use chat_archive::progress::NoProgress;
use chat_archive::reconcile::{reconcile, ReconcileOptions, SyncReport};
use chat_archive::{db, migrate};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A migrated archive in a temporary directory.
pub async fn archive() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("archive.sqlite3"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    (tmp, pool)
}

/// Another pool on the same archive file, as a second process would have.
pub async fn second_pool(tmp: &TempDir) -> SqlitePool {
    db::connect_path(&tmp.path().join("archive.sqlite3"))
        .await
        .unwrap()
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc()
}

pub fn account() -> AccountRef {
    AccountRef::new("export", "test")
}

pub async fn sync(pool: &SqlitePool, backend: &MemoryBackend) -> SyncReport {
    sync_with(pool, backend, &ReconcileOptions::default()).await
}

pub async fn sync_with(
    pool: &SqlitePool,
    backend: &MemoryBackend,
    options: &ReconcileOptions,
) -> SyncReport {
    reconcile(pool, backend, &account(), options, &NoProgress)
        .await
        .unwrap()
}

pub async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

pub async fn conversation_id(pool: &SqlitePool, external_id: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM conversations WHERE external_id = ?")
        .bind(external_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Stored watermark of a conversation, in milliseconds.
pub async fn watermark(pool: &SqlitePool, external_id: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT last_modified FROM conversations WHERE external_id = ?")
        .bind(external_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn import_error(pool: &SqlitePool, external_id: &str) -> (bool, Option<String>) {
    sqlx::query_as("SELECT import_error, error_detail FROM conversations WHERE external_id = ?")
        .bind(external_id)
        .fetch_one(pool)
        .await
        .unwrap()
}
