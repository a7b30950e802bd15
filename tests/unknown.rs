mod common;

use chat_archive::backend::MemoryBackend;
use chat_archive::error::ResolveError;
use chat_archive::models::{ConversationDescriptor, MessageRecord};
use chat_archive::progress::NoProgress;
use chat_archive::reconcile::{reconcile, ReconcileOptions};
use chat_archive::unknown::{list_unresolved, resolve};
use common::*;
use sqlx::SqlitePool;

fn unknown(at: &str, text: &str, placeholder: &str) -> MessageRecord {
    MessageRecord::new(None, None, ts(at), text).with_placeholder(placeholder)
}

fn private_with_unknown() -> MemoryBackend {
    MemoryBackend::new().with_conversation(
        ConversationDescriptor::private("dm").full_rescan(),
        vec![
            MessageRecord::new(Some("m1"), Some("me"), ts("2018-08-02 10:00:00"), "hi, who is this?"),
            unknown("2018-08-02 10:01:00", "it's carol", "+31 6 1234"),
            unknown("2018-08-02 10:02:00", "new number", "+31 6 1234"),
        ],
    )
}

async fn null_senders(pool: &SqlitePool) -> i64 {
    count(pool, "SELECT COUNT(*) FROM messages WHERE sender_id IS NULL").await
}

#[tokio::test]
async fn test_resolve_attaches_new_contact() {
    let (_tmp, pool) = archive().await;
    sync(&pool, &private_with_unknown()).await;
    let id = conversation_id(&pool, "dm").await;

    let unresolved = list_unresolved(&pool).await.unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].conversation_id, id);
    assert_eq!(unresolved[0].placeholder.as_deref(), Some("+31 6 1234"));
    assert_eq!(unresolved[0].message_count, 2);

    assert_eq!(resolve(&pool, id, "  Carol Example ").await.unwrap(), 2);
    assert_eq!(null_senders(&pool).await, 0);
    assert!(list_unresolved(&pool).await.unwrap().is_empty());

    let (external_id, name): (Option<String>, Option<String>) = sqlx::query_as(
        "SELECT c.external_id, c.full_name FROM messages m JOIN contacts c ON c.id = m.sender_id WHERE m.text = 'new number'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(external_id, None);
    assert_eq!(name.as_deref(), Some("Carol Example"));
}

#[tokio::test]
async fn test_resolve_twice_is_a_no_op() {
    let (_tmp, pool) = archive().await;
    sync(&pool, &private_with_unknown()).await;
    let id = conversation_id(&pool, "dm").await;

    resolve(&pool, id, "Carol").await.unwrap();
    let contacts = count(&pool, "SELECT COUNT(*) FROM contacts").await;

    assert_eq!(resolve(&pool, id, "Carol").await.unwrap(), 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM contacts").await, contacts);
}

#[tokio::test]
async fn test_resync_after_resolve_does_not_duplicate() {
    let (_tmp, pool) = archive().await;
    let backend = private_with_unknown();
    sync(&pool, &backend).await;
    let id = conversation_id(&pool, "dm").await;
    resolve(&pool, id, "Carol").await.unwrap();

    let report = sync(&pool, &backend).await;
    assert_eq!(report.messages_added, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM messages").await, 3);
    assert_eq!(null_senders(&pool).await, 0);
}

#[tokio::test]
async fn test_two_unknown_senders_are_ambiguous() {
    let (_tmp, pool) = archive().await;
    sync(
        &pool,
        &MemoryBackend::new().with_conversation(
            ConversationDescriptor::private("dm"),
            vec![
                unknown("2018-08-02 10:01:00", "first", "+31 6 1234"),
                unknown("2018-08-02 10:02:00", "second", "+31 6 9999"),
            ],
        ),
    )
    .await;
    let id = conversation_id(&pool, "dm").await;

    let err = resolve(&pool, id, "Carol").await.unwrap_err();
    assert!(matches!(err, ResolveError::Ambiguous(_, 2)));
    assert!(err.to_string().contains("ambiguous"));

    assert_eq!(null_senders(&pool).await, 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM contacts").await, 0);
    assert_eq!(list_unresolved(&pool).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_group_conversation_is_rejected() {
    let (_tmp, pool) = archive().await;
    sync(
        &pool,
        &MemoryBackend::new().with_conversation(
            ConversationDescriptor::group("g", "Group"),
            vec![unknown("2018-08-02 10:01:00", "hi all", "+31 6 1234")],
        ),
    )
    .await;
    let id = conversation_id(&pool, "g").await;

    let err = resolve(&pool, id, "Carol").await.unwrap_err();
    assert!(matches!(err, ResolveError::GroupConversation(_)));
    assert_eq!(null_senders(&pool).await, 1);
}

#[tokio::test]
async fn test_empty_name_is_rejected() {
    let (_tmp, pool) = archive().await;
    sync(&pool, &private_with_unknown()).await;
    let id = conversation_id(&pool, "dm").await;

    let err = resolve(&pool, id, "   ").await.unwrap_err();
    assert!(matches!(err, ResolveError::NoName));
    assert_eq!(err.to_string(), "no name provided");
    assert_eq!(null_senders(&pool).await, 2);
}

#[tokio::test]
async fn test_missing_conversation_is_reported() {
    let (_tmp, pool) = archive().await;
    let err = resolve(&pool, 999, "Carol").await.unwrap_err();
    assert!(matches!(err, ResolveError::NotFound(999)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_alongside_a_sync() {
    let (tmp, pool) = archive().await;
    sync(&pool, &private_with_unknown()).await;
    let id = conversation_id(&pool, "dm").await;
    let other = second_pool(&tmp).await;

    let mut later = MemoryBackend::new();
    for n in 0..20 {
        later = later.with_conversation(
            ConversationDescriptor::private(format!("other-{}", n)),
            vec![unknown("2018-08-03 09:00:00", "elsewhere", "+31 6 5555")],
        );
    }
    later = later.with_conversation(
        ConversationDescriptor::private("dm").full_rescan(),
        vec![
            MessageRecord::new(Some("m1"), Some("me"), ts("2018-08-02 10:00:00"), "hi, who is this?"),
            unknown("2018-08-02 10:01:00", "it's carol", "+31 6 1234"),
            unknown("2018-08-02 10:02:00", "new number", "+31 6 1234"),
            unknown("2018-08-03 10:00:00", "still me", "+31 6 1234"),
        ],
    );

    let (sync_account, sync_options) = (account(), ReconcileOptions::default());
    let (resolved, synced) = tokio::join!(
        resolve(&pool, id, "Carol"),
        reconcile(
            &other,
            &later,
            &sync_account,
            &sync_options,
            &NoProgress,
        ),
    );
    let resolved = resolved.unwrap();
    synced.unwrap();

    assert!(resolved == 2 || resolved == 3);
    let left = count(
        &pool,
        "SELECT COUNT(*) FROM messages m JOIN conversations c ON c.id = m.conversation_id WHERE c.external_id = 'dm' AND m.sender_id IS NULL",
    )
    .await;
    assert_eq!(left, 3 - resolved as i64);
}
