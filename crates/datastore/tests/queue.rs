//! Contract suite of the replication queue. Runs against the in-memory
//! implementation; the Postgres implementation satisfies the same contract
//! and is exercised against a real database in deployment environments.

use std::time::Duration;

use datastore::{ChangeType, JobState, MemoryQueue, ReplicationJob, ReplicationQueue};

fn update_job(path: &str, target: &str) -> ReplicationJob {
    ReplicationJob {
        change: ChangeType::Update,
        virtual_storage: "default".to_string(),
        relative_path: path.to_string(),
        source_storage: Some("node-a".to_string()),
        target_storage: target.to_string(),
        params: None,
    }
}

#[tokio::test]
async fn enqueue_dequeue_acknowledge_round_trip() {
    let queue = MemoryQueue::new();

    let event = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    assert_eq!(event.state, JobState::Ready);
    assert_eq!(event.attempt, 3);
    assert_eq!(event.lock_id, "default|node-b|@repos/a");

    let dequeued = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].id, event.id);
    assert_eq!(dequeued[0].state, JobState::InProgress);
    assert_eq!(dequeued[0].attempt, 2);

    let acked = queue
        .acknowledge(JobState::Completed, &[event.id])
        .await
        .unwrap();
    assert_eq!(acked, vec![event.id]);

    // A completed event never surfaces again.
    assert!(queue.dequeue("default", "node-b", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn dequeue_is_scoped_to_the_target() {
    let queue = MemoryQueue::new();
    queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();

    assert!(queue.dequeue("default", "node-c", 10).await.unwrap().is_empty());
    assert!(queue.dequeue("other", "node-b", 10).await.unwrap().is_empty());
    assert_eq!(queue.dequeue("default", "node-b", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn at_most_one_in_progress_event_per_lock() {
    let queue = MemoryQueue::new();
    let first = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    let second = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    let other = queue.enqueue(update_job("@repos/z", "node-b")).await.unwrap();

    // One batch never carries two events of the same lock_id, and an
    // in-progress lock blocks later dequeues.
    let batch = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(
        batch.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![first.id, other.id]
    );
    assert!(queue.dequeue("default", "node-b", 10).await.unwrap().is_empty());

    // Failing the first event releases the lock; the queue stays FIFO
    // within the lock by retrying the failed event first.
    queue.acknowledge(JobState::Failed, &[first.id]).await.unwrap();
    let batch = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, first.id);

    queue.acknowledge(JobState::Completed, &[first.id]).await.unwrap();
    let batch = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, second.id);
}

#[tokio::test]
async fn failed_events_retry_until_attempts_are_exhausted() {
    let queue = MemoryQueue::new();
    let event = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();

    for remaining in [2, 1, 0] {
        let batch = queue.dequeue("default", "node-b", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempt, remaining);

        if remaining > 0 {
            queue.acknowledge(JobState::Failed, &[event.id]).await.unwrap();
        }
    }

    // The last acknowledgement must be dead, not failed.
    assert!(queue.acknowledge(JobState::Failed, &[event.id]).await.is_err());
    let acked = queue.acknowledge(JobState::Dead, &[event.id]).await.unwrap();
    assert_eq!(acked, vec![event.id]);

    assert!(queue.dequeue("default", "node-b", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn completed_update_supersedes_identical_ready_jobs() {
    let queue = MemoryQueue::new();

    let first = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    let dequeued = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(dequeued.len(), 1);

    // Two identical jobs arrive while the first is being processed.
    queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    // A job with a different payload survives the dedup sweep.
    let distinct = queue.enqueue(update_job("@repos/b", "node-b")).await.unwrap();

    queue
        .acknowledge(JobState::Completed, &[first.id])
        .await
        .unwrap();

    let remaining = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(
        remaining.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![distinct.id]
    );
}

#[tokio::test]
async fn dedup_only_covers_jobs_enqueued_before_completion() {
    let queue = MemoryQueue::new();

    let first = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    queue.dequeue("default", "node-b", 10).await.unwrap();
    queue
        .acknowledge(JobState::Completed, &[first.id])
        .await
        .unwrap();

    // Enqueued after completion: must not be swept.
    let later = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    let batch = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, later.id);
}

#[tokio::test]
async fn acknowledging_events_not_in_progress_is_a_no_op() {
    let queue = MemoryQueue::new();
    let event = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();

    let acked = queue
        .acknowledge(JobState::Completed, &[event.id, 42])
        .await
        .unwrap();
    assert!(acked.is_empty());

    assert!(queue.acknowledge(JobState::Ready, &[event.id]).await.is_err());
}

#[tokio::test]
async fn stale_in_progress_events_are_swept_back_to_failed() {
    let queue = MemoryQueue::new();
    let event = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    queue.dequeue("default", "node-b", 10).await.unwrap();

    // Touching keeps ownership: nothing is older than a generous window.
    let touched = queue.touch(&[event.id]).await.unwrap();
    assert_eq!(touched, vec![event.id]);
    assert_eq!(
        queue.acknowledge_stale(Duration::from_secs(3600)).await.unwrap(),
        0
    );

    // The owning instance disappears; the sweep releases the event and a
    // survivor picks it up again.
    assert_eq!(queue.acknowledge_stale(Duration::ZERO).await.unwrap(), 1);
    let batch = queue.dequeue("default", "node-b", 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, event.id);

    assert!(queue.touch(&[42]).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_events_are_terminal() {
    let queue = MemoryQueue::new();
    let event = queue.enqueue(update_job("@repos/a", "node-b")).await.unwrap();
    queue.dequeue("default", "node-b", 10).await.unwrap();

    queue
        .acknowledge(JobState::Cancelled, &[event.id])
        .await
        .unwrap();
    assert!(queue.dequeue("default", "node-b", 10).await.unwrap().is_empty());
    assert!(queue.touch(&[event.id]).await.unwrap().is_empty());
}
