use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create any missing tables and indexes. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Create accounts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            backend TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(backend, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create contacts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            external_id TEXT,
            full_name TEXT,
            email TEXT,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create conversations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            external_id TEXT NOT NULL,
            name TEXT,
            is_group INTEGER NOT NULL DEFAULT 0,
            last_modified INTEGER,
            import_error INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            UNIQUE(account_id, external_id),
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create messages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            conversation_id INTEGER NOT NULL,
            external_id TEXT,
            fingerprint TEXT,
            sender_id INTEGER,
            sender_placeholder TEXT,
            timestamp INTEGER NOT NULL,
            text TEXT NOT NULL,
            html TEXT,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id),
            FOREIGN KEY (sender_id) REFERENCES contacts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Uniqueness of rows with a native id
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_contacts_external_id ON contacts(account_id, external_id) WHERE external_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_messages_external_id ON messages(conversation_id, external_id) WHERE external_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_messages_fingerprint ON messages(conversation_id, fingerprint) WHERE fingerprint IS NOT NULL",
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_timestamp ON messages(conversation_id, timestamp, id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_sender_id ON messages(sender_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_account_id ON conversations(account_id)")
        .execute(pool)
        .await?;

    Ok(())
}
