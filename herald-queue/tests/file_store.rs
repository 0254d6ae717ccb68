//! File-backed queue behaviour across store instances sharing a directory

use std::{collections::HashSet, sync::Arc, time::Duration};

use herald_queue::{
    Claim, ClaimRequest, Failure, FileQueueStore, MessageId, QueueError, QueueFilter, QueueStore,
    Recipient, RecipientClass, WriteOutcome,
};
use pretty_assertions::assert_eq;

fn open(dir: &tempfile::TempDir) -> FileQueueStore {
    let store = FileQueueStore::new(dir.path()).expect("store");
    store.init().expect("init");
    store
}

fn request(limit: usize) -> ClaimRequest<'static> {
    ClaimRequest {
        limit,
        exclude: &[],
        lease: Duration::from_secs(60),
        retry_threshold: 5,
    }
}

fn body(to: &str) -> String {
    format!("To: {to}\r\nSubject: Hello\r\n\r\nHi there\r\n")
}

#[tokio::test]
async fn messages_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let id = {
        let store = open(&dir);
        store
            .enqueue(Recipient::user(42), body("a@example.com"))
            .await
            .expect("enqueue")
    };

    let store = open(&dir);
    let message = store.get(id).await.expect("get");
    assert_eq!(message.recipient, Recipient::user(42));
    assert_eq!(message.body, body("a@example.com"));
    assert_eq!(message.error_count, 0);
    assert!(message.sent_at.is_none());
}

#[tokio::test]
async fn ids_are_not_reused_after_deleting_the_newest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);

    let first = store
        .enqueue(Recipient::direct("a@example.com"), body("a@example.com"))
        .await
        .expect("enqueue");
    let second = store
        .enqueue(Recipient::direct("b@example.com"), body("b@example.com"))
        .await
        .expect("enqueue");
    store.delete(second).await.expect("delete");

    let store = open(&dir);
    let third = store
        .enqueue(Recipient::direct("c@example.com"), body("c@example.com"))
        .await
        .expect("enqueue");

    assert!(first < second && second < third);
}

#[tokio::test]
async fn concurrent_claims_from_separate_instances_never_overlap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let seed = open(&dir);
    for i in 0..20 {
        seed.enqueue(Recipient::direct(format!("u{i}@example.com")), body("x@example.com"))
            .await
            .expect("enqueue");
    }

    // Separate instances do not share the in-process mutex, only the lock file.
    let stores: Vec<Arc<FileQueueStore>> = (0..4).map(|_| Arc::new(open(&dir))).collect();
    let mut tasks = tokio::task::JoinSet::new();
    for store in stores {
        tasks.spawn(async move { store.claim_pending(request(7)).await.expect("claim") });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(claims) = tasks.join_next().await {
        for claim in claims.expect("join") {
            total += 1;
            assert!(seen.insert(claim.id()), "{} claimed twice", claim.id());
        }
    }

    assert_eq!(total, 20);
}

#[tokio::test]
async fn claims_are_persisted_until_released() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);
    store
        .enqueue(Recipient::direct("a@example.com"), body("a@example.com"))
        .await
        .expect("enqueue");

    let claim: Claim = store.claim_pending(request(1)).await.expect("claim").remove(0);

    // Another process sees the claim.
    let other = open(&dir);
    assert!(other.claim_pending(request(1)).await.expect("claim").is_empty());
    assert!(matches!(other.take(claim.id()).await, Err(QueueError::Claimed(_))));

    assert_eq!(
        store.release(claim.id(), claim.token()).await.expect("release"),
        WriteOutcome::Applied
    );
    assert_eq!(other.claim_pending(request(1)).await.expect("claim").len(), 1);
}

#[tokio::test]
async fn failure_then_success_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);
    let id = store
        .enqueue(Recipient::direct("a@example.com"), body("a@example.com"))
        .await
        .expect("enqueue");

    let claim = store.claim_pending(request(1)).await.expect("claim").remove(0);
    let count = store
        .record_failure(id, claim.token(), Failure::new("421 try later"))
        .await
        .expect("failure");
    assert_eq!(count, Some(1));

    let failed = store.list_failed(&QueueFilter::default()).await.expect("list");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("421 try later"));

    let claim = store.claim_pending(request(1)).await.expect("claim").remove(0);
    assert_eq!(
        store.mark_sent(id, claim.token()).await.expect("sent"),
        WriteOutcome::Applied
    );

    let sent = store
        .list_sent(&QueueFilter {
            class: Some(RecipientClass::Direct),
            ..QueueFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(sent.iter().map(|m| m.id).collect::<Vec<MessageId>>(), vec![id]);
    assert_eq!(sent[0].error_count, 1);
    assert!(store.list_failed(&QueueFilter::default()).await.expect("list").is_empty());
}

#[tokio::test]
async fn delete_missing_message_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);

    let err = store.delete(MessageId::new(99)).await.expect_err("missing");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn held_claim_survives_exhaustion_and_guards_removal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);
    let id = store
        .enqueue(Recipient::direct("a@example.com"), body("a@example.com"))
        .await
        .expect("enqueue");
    let exhausted = ClaimRequest {
        retry_threshold: 1,
        ..request(1)
    };

    let claim = store.claim_pending(request(1)).await.expect("claim").remove(0);
    store
        .record_failure(id, claim.token(), Failure::new("550 no such user").holding_claim())
        .await
        .expect("failure");

    let other = open(&dir);
    assert!(matches!(other.take(id).await, Err(QueueError::Claimed(_))));
    assert!(other.claim_exhausted(exhausted).await.expect("claim").is_empty());

    let removed = store.remove_claimed(id, claim.token()).await.expect("remove");
    assert_eq!(removed.map(|m| m.error_count), Some(1));
    assert!(other.get(id).await.expect_err("removed").is_not_found());
}

#[tokio::test]
async fn remove_claimed_leaves_nothing_behind_after_operator_delete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir);
    let id = store
        .enqueue(Recipient::direct("a@example.com"), body("a@example.com"))
        .await
        .expect("enqueue");
    let claim = store.claim_pending(request(1)).await.expect("claim").remove(0);

    open(&dir).delete(id).await.expect("delete");

    assert!(store.remove_claimed(id, claim.token()).await.expect("remove").is_none());
    assert!(store.list(&QueueFilter::default()).await.expect("list").is_empty());
}
