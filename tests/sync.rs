mod common;

use chat_archive::backend::MemoryBackend;
use chat_archive::error::BackendError;
use chat_archive::models::{AccountRef, ConversationDescriptor, MessageRecord};
use chat_archive::progress::NoProgress;
use chat_archive::reconcile::ReconcileOptions;
use chat_archive::sync::{sync_accounts, AggregateReport};
use common::*;
use sqlx::SqlitePool;
use std::collections::HashMap;

fn one_conversation(text: &str) -> MemoryBackend {
    MemoryBackend::new().with_conversation(
        ConversationDescriptor::private("shared-id"),
        vec![MessageRecord::new(
            Some("m1"),
            Some("u1"),
            ts("2018-08-02 10:15:00"),
            text,
        )],
    )
}

async fn run(
    pool: &SqlitePool,
    accounts: &[AccountRef],
    sessions: &HashMap<AccountRef, MemoryBackend>,
) -> AggregateReport {
    sync_accounts(
        pool,
        accounts,
        &ReconcileOptions::default(),
        &NoProgress,
        |account| {
            let session = sessions.get(&account).cloned();
            async move {
                session.ok_or_else(|| BackendError::Authentication("bad credentials".into()))
            }
        },
    )
    .await
}

#[tokio::test]
async fn test_failed_session_does_not_affect_other_accounts() {
    let (_tmp, pool) = archive().await;
    let personal = AccountRef::new("export", "personal");
    let locked = AccountRef::new("export", "locked");
    let work = AccountRef::new("export", "work");

    let mut sessions = HashMap::new();
    sessions.insert(personal.clone(), one_conversation("from personal"));
    sessions.insert(work.clone(), one_conversation("from work"));

    let report = run(
        &pool,
        &[personal.clone(), locked.clone(), work.clone()],
        &sessions,
    )
    .await;

    assert_eq!(report.accounts.len(), 3);
    assert!(report.accounts[0].result.is_ok());
    assert!(report.accounts[2].result.is_ok());
    assert!(report.has_fatal_errors());

    let fatal: Vec<_> = report.fatal_errors().collect();
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].0, &locked);
    assert!(fatal[0].1.contains("bad credentials"));

    let totals = report.totals();
    assert_eq!(totals.conversations_synced, 2);
    assert_eq!(totals.messages_added, 2);
}

#[tokio::test]
async fn test_accounts_keep_separate_conversations() {
    let (_tmp, pool) = archive().await;
    let personal = AccountRef::new("export", "personal");
    let work = AccountRef::new("export", "work");

    let mut sessions = HashMap::new();
    sessions.insert(personal.clone(), one_conversation("from personal"));
    sessions.insert(work.clone(), one_conversation("from work"));

    let report = run(&pool, &[personal, work], &sessions).await;
    assert!(!report.has_fatal_errors());

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM accounts").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM conversations").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM contacts").await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM messages").await, 2);
}

#[tokio::test]
async fn test_listing_failure_is_reported_per_account() {
    let (_tmp, pool) = archive().await;
    let down = AccountRef::new("export", "down");
    let up = AccountRef::new("export", "up");

    let mut sessions = HashMap::new();
    sessions.insert(
        down.clone(),
        MemoryBackend::new().with_listing_failure(BackendError::Authentication(
            "network unreachable".into(),
        )),
    );
    sessions.insert(up.clone(), one_conversation("still synced"));

    let report = run(&pool, &[down, up], &sessions).await;
    let fatal: Vec<_> = report.fatal_errors().collect();
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].1.contains("network unreachable"));
    assert_eq!(report.totals().messages_added, 1);
}

#[tokio::test]
async fn test_empty_selection_syncs_nothing() {
    let (_tmp, pool) = archive().await;
    let report = run(&pool, &[], &HashMap::new()).await;
    assert!(report.accounts.is_empty());
    assert!(!report.has_fatal_errors());
    assert_eq!(report.totals().messages_added, 0);
}
