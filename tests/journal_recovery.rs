//! Queue journal recovery tests.

use async_trait::async_trait;
use rollbook::{
    Actor, AuditRecord, BulkInsertResponse, Clock, ConcurrencyController, ErrorKind, Fields,
    ManualClock, MemoryStore, MutationCommand, MutationQueue, MutationStatus, NewRecord,
    PipelineError, QueueConfig, RateLimitPolicy, RemoteError, RemoteStore, Timestamp,
    UpdateResponse, VersionedEntity,
};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn journal_config(path: &Path) -> QueueConfig {
    QueueConfig {
        journal_path: Some(path.to_path_buf()),
        ..Default::default()
    }
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Timestamp(5_000)))
}

fn actor() -> Actor {
    Actor::new("u-1", "Bu Sari")
}

/// Remote store whose calls never complete (connection hangs).
struct HangingStore;

#[async_trait]
impl RemoteStore for HangingStore {
    async fn fetch(&self, _: &str, _: &str) -> Result<Option<VersionedEntity>, RemoteError> {
        std::future::pending().await
    }

    async fn insert(&self, _: &Actor, _: &str, _: &str, _: Fields) -> Result<VersionedEntity, RemoteError> {
        std::future::pending().await
    }

    async fn delete(&self, _: &Actor, _: &str, _: &str) -> Result<VersionedEntity, RemoteError> {
        std::future::pending().await
    }

    async fn update_with_version(
        &self,
        _: &Actor,
        _: &str,
        _: &str,
        _: Fields,
        _: u64,
    ) -> Result<UpdateResponse, RemoteError> {
        std::future::pending().await
    }

    async fn bulk_insert(&self, _: &Actor, _: &str, _: Vec<NewRecord>) -> Result<BulkInsertResponse, RemoteError> {
        std::future::pending().await
    }

    async fn check_rate_limit(&self, _: &str, _: &str, _: u32, _: u32) -> Result<bool, RemoteError> {
        std::future::pending().await
    }

    async fn query_audit_log(&self, _: &str, _: Option<&str>, _: usize) -> Result<Vec<AuditRecord>, RemoteError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_reopen_restores_pending_and_failed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();

    let (pending_id, failed_id) = {
        let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
        let remote = Arc::new(MemoryStore::new(Arc::clone(&clock), RateLimitPolicy::default()));
        let controller = ConcurrencyController::new(remote, RateLimitPolicy::default(), Arc::clone(&clock));

        let failed_id = queue
            .enqueue(actor(), MutationCommand::delete("tasks", "missing", Fields::new()))
            .unwrap();
        queue.dispatch(&controller).await.unwrap();

        let pending_id = queue
            .enqueue(
                actor(),
                MutationCommand::create("tasks", "t-1", json!({"title": "PR"}).as_object().cloned().unwrap()),
            )
            .unwrap();
        (pending_id, failed_id)
    };

    let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.failed_count(), 1);

    let failed = queue.get(failed_id).unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.last_error.unwrap().kind, ErrorKind::NotFound);

    let pending = queue.get(pending_id).unwrap();
    assert_eq!(pending.created_at, Timestamp(5_000));
    assert_eq!(pending.payload.record_id(), "t-1");

    // Ids keep growing after a reopen.
    let next = queue
        .enqueue(actor(), MutationCommand::create("tasks", "t-2", Fields::new()))
        .unwrap();
    assert!(next > pending_id);
}

#[tokio::test]
async fn test_interrupted_sync_comes_back_failed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();

    let id = {
        let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
        let controller = ConcurrencyController::new(
            Arc::new(HangingStore),
            RateLimitPolicy::default(),
            Arc::clone(&clock),
        );
        let id = queue
            .enqueue(actor(), MutationCommand::create("tasks", "t-1", Fields::new()))
            .unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), queue.dispatch(&controller)).await;
        assert!(timed_out.is_err());
        assert_eq!(queue.get(id).unwrap().status, MutationStatus::Syncing);
        id
    };

    let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
    let record = queue.get(id).unwrap();
    assert_eq!(record.status, MutationStatus::Failed);
    assert_eq!(record.last_error.unwrap().kind, ErrorKind::Unknown);

    queue.retry(id).unwrap();
    assert_eq!(queue.pending_count(), 1);
}

#[test]
fn test_removed_entries_stay_removed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();

    {
        let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
        let a = queue
            .enqueue(actor(), MutationCommand::create("tasks", "a", Fields::new()))
            .unwrap();
        queue
            .enqueue(actor(), MutationCommand::create("tasks", "b", Fields::new()))
            .unwrap();
        assert!(queue.remove(a).unwrap());
    }

    let queue = MutationQueue::open(journal_config(&path), clock, None).unwrap();
    let remaining: Vec<_> = queue.list().into_iter().map(|r| r.payload.record_id().to_string()).collect();
    assert_eq!(remaining, vec!["b"]);
}

#[test]
fn test_compaction_shrinks_journal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();

    let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
    for n in 0..200 {
        let id = queue
            .enqueue(actor(), MutationCommand::create("tasks", format!("t-{}", n), Fields::new()))
            .unwrap();
        if n % 10 != 0 {
            queue.remove(id).unwrap();
        }
    }
    let before = std::fs::metadata(&path).unwrap().len();
    queue.compact().unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before);
    drop(queue);

    let queue = MutationQueue::open(journal_config(&path), clock, None).unwrap();
    assert_eq!(queue.len(), 20);
}

#[test]
fn test_automatic_compaction_keeps_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();
    let config = QueueConfig {
        compact_after: 16,
        ..journal_config(&path)
    };

    {
        let queue = MutationQueue::open(config.clone(), Arc::clone(&clock), None).unwrap();
        for n in 0..100 {
            let id = queue
                .enqueue(actor(), MutationCommand::create("tasks", format!("t-{}", n), Fields::new()))
                .unwrap();
            if n != 99 {
                queue.remove(id).unwrap();
            }
        }
    }

    let queue = MutationQueue::open(config, clock, None).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.list()[0].payload.record_id(), "t-99");
}

#[test]
fn test_journal_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");

    let _first = MutationQueue::open(journal_config(&path), clock(), None).unwrap();
    let second = MutationQueue::open(journal_config(&path), clock(), None);
    assert!(matches!(second, Err(PipelineError::Locked)));
}

#[test]
fn test_writes_after_torn_tail_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutations.journal");
    let clock = clock();

    {
        let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
        queue
            .enqueue(actor(), MutationCommand::create("tasks", "a", Fields::new()))
            .unwrap();
    }
    {
        // Crash mid-write: a length prefix with only part of its body.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
    }
    {
        let queue = MutationQueue::open(journal_config(&path), Arc::clone(&clock), None).unwrap();
        assert_eq!(queue.len(), 1);
        queue
            .enqueue(actor(), MutationCommand::create("tasks", "b", Fields::new()))
            .unwrap();
    }

    let queue = MutationQueue::open(journal_config(&path), clock, None).unwrap();
    let ids: Vec<_> = queue.list().into_iter().map(|r| r.payload.record_id().to_string()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}
