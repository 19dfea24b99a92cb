use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use webhook_ingress::{
    AuditLog, AuditOutcome, CanonicalEvent, DlqStatus, EventId, InMemoryAuditLog,
    PipelineCounters, RawDelivery, RetryExecutor, RetryPolicy, RetryQueue, RetryQueueConfig,
    Stage, StageFailure,
};

/// Replay target that fails the first N calls transiently.
struct ScriptedExecutor {
    calls: AtomicU32,
    failures_remaining: AtomicU32,
}

impl ScriptedExecutor {
    fn failing(n: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(n),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryExecutor for ScriptedExecutor {
    async fn replay(&self, _event: &CanonicalEvent) -> Result<(), StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            Err(StageFailure::transient(Stage::Invocation, "still down"))
        } else {
            Ok(())
        }
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(5),
        multiplier: 2,
        max_attempts: 3,
        max_delay: Duration::from_millis(50),
    }
}

fn sample_event(id: &str) -> CanonicalEvent {
    let delivery = RawDelivery::new("ghl", b"{}".to_vec());
    CanonicalEvent::skeletal(EventId(id.into()), &delivery)
}

fn queue_with(
    executor: Arc<ScriptedExecutor>,
) -> (RetryQueue, Arc<InMemoryAuditLog>, Arc<PipelineCounters>) {
    let audit = Arc::new(InMemoryAuditLog::new());
    let counters = Arc::new(PipelineCounters::default());
    let config = RetryQueueConfig {
        worker_count: 2,
        ..RetryQueueConfig::default()
    };
    let queue = RetryQueue::new(config, executor, audit.clone(), counters.clone());
    (queue, audit, counters)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let executor = ScriptedExecutor::failing(0);
    let (queue, audit, counters) = queue_with(executor.clone());

    queue
        .submit(
            sample_event("evt_p"),
            StageFailure::permanent(Stage::Normalization, "bad mapping"),
            fast_policy(),
        )
        .await;

    let entries = queue.dlq_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Pending);
    assert_eq!(entries[0].retry_count, 0);
    assert_eq!(entries[0].error_message, "bad mapping");
    assert_eq!(executor.calls(), 0);
    assert_eq!(counters.snapshot().dead_lettered, 1);

    let records = audit.records().await;
    assert!(records
        .iter()
        .any(|r| r.outcome == AuditOutcome::DeadLettered));
}

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    let executor = ScriptedExecutor::failing(2);
    let (queue, audit, counters) = queue_with(executor.clone());

    queue
        .submit(
            sample_event("evt_t"),
            StageFailure::transient(Stage::Invocation, "timeout"),
            fast_policy(),
        )
        .await;

    wait_until(|| counters.snapshot().retried_ok == 1).await;

    assert_eq!(executor.calls(), 3);
    assert_eq!(counters.snapshot().retries_scheduled, 3);
    assert!(queue.dlq_entries().await.is_empty());

    let scheduled = audit
        .records()
        .await
        .into_iter()
        .filter(|r| r.outcome == AuditOutcome::RetryScheduled)
        .count();
    assert_eq!(scheduled, 3);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_attempt_count() {
    let executor = ScriptedExecutor::failing(u32::MAX);
    let (queue, _audit, counters) = queue_with(executor.clone());

    queue
        .submit(
            sample_event("evt_x"),
            StageFailure::transient(Stage::Invocation, "timeout"),
            fast_policy(),
        )
        .await;

    wait_until(|| counters.snapshot().dead_lettered == 1).await;

    let entries = queue.dlq_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Pending);
    assert_eq!(entries[0].retry_count, 3);
    assert_eq!(executor.calls(), 3);
}

#[tokio::test]
async fn operator_retry_re_enqueues_one_attempt() {
    let executor = ScriptedExecutor::failing(0);
    let (queue, audit, counters) = queue_with(executor.clone());

    queue
        .submit(
            sample_event("evt_op"),
            StageFailure::permanent(Stage::Invocation, "410 gone"),
            fast_policy(),
        )
        .await;
    let id = queue.dlq_entries().await[0].id;

    assert!(queue.retry_entry(id).await);
    wait_until(|| counters.snapshot().retried_ok == 1).await;

    let entries = queue.dlq_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Retried);
    assert!(entries[0].retried_at.is_some());
    assert_eq!(executor.calls(), 1);

    let records = audit.records().await;
    assert!(records
        .iter()
        .any(|r| r.outcome == AuditOutcome::OperatorRetried));

    // Only pending entries can be acted on again.
    assert!(!queue.retry_entry(id).await);
    assert!(!queue.resolve_entry(id).await);
}

#[tokio::test]
async fn failed_operator_retry_creates_a_fresh_pending_entry() {
    let executor = ScriptedExecutor::failing(u32::MAX);
    let (queue, _audit, counters) = queue_with(executor.clone());

    queue
        .submit(
            sample_event("evt_again"),
            StageFailure::permanent(Stage::Invocation, "410 gone"),
            fast_policy(),
        )
        .await;
    let id = queue.dlq_entries().await[0].id;

    assert!(queue.retry_entry(id).await);
    wait_until(|| counters.snapshot().dead_lettered == 2).await;

    let pending = queue.dlq_entries_with_status(DlqStatus::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0].id, id);
    assert_eq!(pending[0].retry_count, 1);

    let retried = queue.dlq_entries_with_status(DlqStatus::Retried).await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].id, id);
}

#[tokio::test]
async fn resolve_and_discard_are_terminal() {
    let executor = ScriptedExecutor::failing(0);
    let (queue, audit, _counters) = queue_with(executor);

    for id in ["evt_1", "evt_2"] {
        queue
            .submit(
                sample_event(id),
                StageFailure::permanent(Stage::Invocation, "410 gone"),
                fast_policy(),
            )
            .await;
    }
    let entries = queue.dlq_entries().await;
    let (a, b) = (entries[0].id, entries[1].id);

    assert!(queue.resolve_entry(a).await);
    assert!(queue.discard_entry(b, "provider fixed upstream").await);

    let entries = queue.dlq_entries().await;
    let resolved = entries.iter().find(|e| e.id == a).unwrap();
    assert_eq!(resolved.status, DlqStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let discarded = entries.iter().find(|e| e.id == b).unwrap();
    assert_eq!(discarded.status, DlqStatus::Discarded);
    assert_eq!(
        discarded.discard_reason.as_deref(),
        Some("provider fixed upstream")
    );

    // Terminal entries reject further operator actions.
    assert!(!queue.retry_entry(a).await);
    assert!(!queue.discard_entry(a, "again").await);
    assert!(!queue.resolve_entry(b).await);

    let records = audit.records().await;
    assert!(records
        .iter()
        .any(|r| r.outcome == AuditOutcome::OperatorResolved));
    assert!(records
        .iter()
        .any(|r| r.outcome == AuditOutcome::OperatorDiscarded));
}

#[tokio::test]
async fn dlq_at_capacity_evicts_settled_entries_first() {
    let executor = ScriptedExecutor::failing(0);
    let audit = Arc::new(InMemoryAuditLog::new());
    let counters = Arc::new(PipelineCounters::default());
    let queue = RetryQueue::new(
        RetryQueueConfig {
            worker_count: 1,
            dlq_capacity: 2,
            ..RetryQueueConfig::default()
        },
        executor,
        audit,
        counters.clone(),
    );

    for id in ["evt_1", "evt_2"] {
        queue
            .submit(
                sample_event(id),
                StageFailure::permanent(Stage::Invocation, "410 gone"),
                fast_policy(),
            )
            .await;
    }
    let first = queue.dlq_entries().await[0].id;
    assert!(queue.resolve_entry(first).await);

    queue
        .submit(
            sample_event("evt_3"),
            StageFailure::permanent(Stage::Invocation, "410 gone"),
            fast_policy(),
        )
        .await;

    // The resolved entry made room; nothing pending was lost.
    let entries = queue.dlq_entries().await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == DlqStatus::Pending));
    assert_eq!(counters.snapshot().dlq_dropped, 0);
}

#[tokio::test]
async fn pending_eviction_is_counted_and_audited() {
    let executor = ScriptedExecutor::failing(0);
    let audit = Arc::new(InMemoryAuditLog::new());
    let counters = Arc::new(PipelineCounters::default());
    let queue = RetryQueue::new(
        RetryQueueConfig {
            worker_count: 1,
            dlq_capacity: 1,
            ..RetryQueueConfig::default()
        },
        executor,
        audit.clone(),
        counters.clone(),
    );

    for id in ["evt_old", "evt_new"] {
        queue
            .submit(
                sample_event(id),
                StageFailure::permanent(Stage::Invocation, "410 gone"),
                fast_policy(),
            )
            .await;
    }

    let entries = queue.dlq_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event.event_id.0, "evt_new");
    assert_eq!(counters.snapshot().dlq_dropped, 1);

    let records = audit.records().await;
    let evicted = records
        .iter()
        .find(|r| r.outcome == AuditOutcome::Evicted)
        .expect("eviction audited");
    assert_eq!(evicted.event_id.as_ref().unwrap().0, "evt_old");
}

#[tokio::test]
async fn dlq_listings_filter_by_source() {
    let executor = ScriptedExecutor::failing(0);
    let (queue, _audit, _counters) = queue_with(executor);

    let ghl = CanonicalEvent::skeletal(
        EventId("evt_g".into()),
        &RawDelivery::new("ghl", b"{}".to_vec()),
    );
    let stripe = CanonicalEvent::skeletal(
        EventId("evt_s".into()),
        &RawDelivery::new("stripe", b"{}".to_vec()),
    );
    for event in [ghl, stripe] {
        queue
            .submit(
                event,
                StageFailure::permanent(Stage::Invocation, "410 gone"),
                fast_policy(),
            )
            .await;
    }

    let ghl_entries = queue
        .dlq_entries_for_source(&webhook_ingress::Source::new("ghl"))
        .await;
    assert_eq!(ghl_entries.len(), 1);
    assert_eq!(ghl_entries[0].event.event_id.0, "evt_g");
}

#[tokio::test]
async fn shutdown_drains_scheduled_work() {
    let executor = ScriptedExecutor::failing(0);
    let audit = Arc::new(InMemoryAuditLog::new());
    let counters = Arc::new(PipelineCounters::default());
    let mut queue = RetryQueue::new(
        RetryQueueConfig {
            worker_count: 1,
            ..RetryQueueConfig::default()
        },
        executor.clone(),
        audit,
        counters.clone(),
    );

    queue
        .submit(
            sample_event("evt_drain"),
            StageFailure::transient(Stage::Invocation, "timeout"),
            fast_policy(),
        )
        .await;
    queue.shutdown().await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(counters.snapshot().retried_ok, 1);
}
