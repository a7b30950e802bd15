//! The `accounts` command: configured accounts and their health.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::{expand_home, Config};
use crate::db;
use crate::migrate;
use crate::models::AccountRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    pub account: AccountRef,
    pub status: String,
    pub healthy: bool,
    pub conversations: i64,
    pub failed_conversations: i64,
}

/// Health check without opening a session: an export account is healthy
/// when its directory exists.
pub fn check_health(config: &Config, account: &AccountRef) -> (String, bool) {
    match config.account(account) {
        None => ("NOT CONFIGURED".to_string(), false),
        Some(settings) => match &settings.path {
            Some(path) if expand_home(path).is_dir() => ("OK".to_string(), true),
            Some(_) => ("NOT CONFIGURED (path does not exist)".to_string(), false),
            None => ("NOT CONFIGURED (no path)".to_string(), false),
        },
    }
}

/// Configured accounts with their archive counts.
pub async fn account_statuses(pool: &SqlitePool, config: &Config) -> Result<Vec<AccountStatus>> {
    let mut statuses = Vec::new();
    for account in config.configured_accounts() {
        let (status, healthy) = check_health(config, &account);
        let (conversations, failed_conversations): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(c.id), COALESCE(SUM(c.import_error), 0)
            FROM accounts a
            LEFT JOIN conversations c ON c.account_id = a.id
            WHERE a.backend = ? AND a.name = ?
            "#,
        )
        .bind(&account.backend)
        .bind(&account.account)
        .fetch_one(pool)
        .await?;

        statuses.push(AccountStatus {
            account,
            status,
            healthy,
            conversations,
            failed_conversations,
        });
    }
    Ok(statuses)
}

pub async fn list_accounts(config: &Config) -> Result<()> {
    if config.configured_accounts().is_empty() {
        println!("No accounts configured.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let statuses = account_statuses(&pool, config).await?;
    pool.close().await;

    println!(
        "{:<28} {:<40} {:<8} {:>6} {:>7}",
        "ACCOUNT", "STATUS", "HEALTHY", "CONVS", "FAILED"
    );
    for s in &statuses {
        println!(
            "{:<28} {:<40} {:<8} {:>6} {:>7}",
            s.account.to_string(),
            s.status,
            s.healthy,
            s.conversations,
            s.failed_conversations
        );
    }

    Ok(())
}
