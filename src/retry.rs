use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::error::{ErrorClass, Stage, StageFailure};
use crate::pipeline::PipelineCounters;
use crate::types::{CanonicalEvent, DlqEntry, DlqStatus, RetryPolicy, Source};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Per-failed-event lifecycle:
/// `Received -> Retrying(1..N) -> {Succeeded | DeadLettered}`.
///
/// Transitions are plain functions so attempt counting and backoff are
/// unit-testable without a running queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    Received,
    Retrying { attempt: u32 },
    Succeeded,
    DeadLettered,
}

impl RetryState {
    /// The state that follows a failure in this one.
    pub fn next_after_failure(&self, max_attempts: u32) -> RetryState {
        match self {
            RetryState::Received => {
                if max_attempts >= 1 {
                    RetryState::Retrying { attempt: 1 }
                } else {
                    RetryState::DeadLettered
                }
            }
            RetryState::Retrying { attempt } => {
                if *attempt >= max_attempts {
                    RetryState::DeadLettered
                } else {
                    RetryState::Retrying {
                        attempt: attempt + 1,
                    }
                }
            }
            terminal => *terminal,
        }
    }

    /// Retry attempts performed so far.
    pub fn attempt(&self) -> u32 {
        match self {
            RetryState::Retrying { attempt } => *attempt,
            _ => 0,
        }
    }
}

/// Deterministic backoff: `min(base * multiplier^(attempt-1), max_delay)`.
pub fn retry_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base_ms = policy.base.as_millis() as u64;
    let pow = u64::from(policy.multiplier).saturating_pow(attempt.saturating_sub(1));
    let exp = base_ms.saturating_mul(pow);
    Duration::from_millis(exp.min(policy.max_delay.as_millis() as u64))
}

/// Backoff jittered by ±10% to avoid synchronized retry storms.
pub fn jittered_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay = retry_delay(attempt, policy);
    let factor = 0.9 + fastrand::f64() * 0.2;
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Replays a failed event into the pipeline at the Normalizer stage.
///
/// The queue never retries a stage internally; it only re-runs the
/// whole tail of the pipeline through this capability.
#[async_trait::async_trait]
pub trait RetryExecutor: Send + Sync {
    async fn replay(&self, event: &CanonicalEvent) -> Result<(), StageFailure>;
}

/// A failed event travelling through the retry queue.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub event: CanonicalEvent,
    pub stage: Stage,
    pub error: String,
    pub state: RetryState,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// Bounded worker pool size, independent of inbound concurrency.
    pub worker_count: usize,
    pub queue_size: usize,
    /// Optional outbound rate limit across all retry workers.
    pub max_rps: Option<u32>,
    pub burst: Option<u32>,
    pub dlq_capacity: usize,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count,
            queue_size: 1_000,
            max_rps: None,
            burst: None,
            dlq_capacity: 10_000,
        }
    }
}

struct TimedJob {
    ready_at: Instant,
    job: RetryJob,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Shared context for retry workers.
struct RetryContext {
    executor: Arc<dyn RetryExecutor>,
    sched_tx: mpsc::Sender<TimedJob>,
    notify: Arc<Notify>,
    dlq: Arc<Mutex<VecDeque<DlqEntry>>>,
    dlq_capacity: usize,
    audit: Arc<dyn AuditLog>,
    counters: Arc<PipelineCounters>,
    bucket: Option<Mutex<TokenBucket>>,
}

/// The single authority deciding retry-vs-DLQ for classified failures.
///
/// Transient failures replay with exponential backoff through a
/// rate-limited worker pool; permanent failures (and exhausted
/// transients) are parked as DLQ entries with `status=pending`.
/// DeadLettered events are never silently dropped.
pub struct RetryQueue {
    ctx: Arc<RetryContext>,
    sched_tx: Option<mpsc::Sender<TimedJob>>,
    is_running: Arc<AtomicBool>,
    scheduler_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl RetryQueue {
    pub fn new(
        config: RetryQueueConfig,
        executor: Arc<dyn RetryExecutor>,
        audit: Arc<dyn AuditLog>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let (sched_tx, mut sched_rx) = mpsc::channel::<TimedJob>(config.queue_size.max(1));
        let (ready_tx, ready_rx) = mpsc::channel::<RetryJob>(config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));

        let notify = Arc::new(Notify::new());
        let is_running = Arc::new(AtomicBool::new(true));
        let dlq = Arc::new(Mutex::new(VecDeque::new()));

        let bucket = config
            .max_rps
            .map(|rps| Mutex::new(TokenBucket::new(config.burst.unwrap_or(rps), rps)));

        let ctx = Arc::new(RetryContext {
            executor,
            sched_tx: sched_tx.clone(),
            notify: notify.clone(),
            dlq: dlq.clone(),
            dlq_capacity: config.dlq_capacity,
            audit,
            counters,
            bucket,
        });

        let mut worker_handles = Vec::with_capacity(config.worker_count.max(1));
        for _ in 0..config.worker_count.max(1) {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_ready_rx.clone(),
                ctx.clone(),
            )));
        }

        let scheduler_notify = notify.clone();
        let scheduler_running = is_running.clone();
        let scheduler_handle = tokio::spawn(async move {
            let mut heap: BinaryHeap<TimedJob> = BinaryHeap::new();

            loop {
                loop {
                    match sched_rx.try_recv() {
                        Ok(timed) => heap.push(timed),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => break,
                    }
                }

                let now = Instant::now();
                while let Some(timed) = heap.peek() {
                    if timed.ready_at > now {
                        break;
                    }
                    let timed = heap.pop().expect("pop");
                    if ready_tx.send(timed.job).await.is_err() {
                        return;
                    }
                }

                let running = scheduler_running.load(Ordering::SeqCst);
                if !running && heap.is_empty() {
                    // Dropping ready_tx lets the workers drain and exit.
                    return;
                }

                if let Some(next_ready) = heap.peek().map(|t| t.ready_at) {
                    tokio::select! {
                        _ = scheduler_notify.notified() => {}
                        _ = sleep_until(next_ready) => {}
                    }
                } else {
                    scheduler_notify.notified().await;
                }
            }
        });

        Self {
            ctx,
            sched_tx: Some(sched_tx),
            is_running,
            scheduler_handle: Some(scheduler_handle),
            worker_handles,
        }
    }

    /// Hand a classified stage failure to the queue.
    ///
    /// Security failures never reach here (rejected at receipt);
    /// permanent failures dead-letter immediately; transient failures
    /// schedule their first retry attempt.
    pub async fn submit(&self, event: CanonicalEvent, failure: StageFailure, policy: RetryPolicy) {
        submit_failure(&self.ctx, event, failure, policy).await;
    }

    /// Clonable submit-side handle for tasks that outlive the caller's
    /// borrow of the queue.
    pub fn submitter(&self) -> Submitter {
        Submitter {
            ctx: self.ctx.clone(),
        }
    }

    /// Snapshot of all DLQ entries.
    pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
        let guard = self.ctx.dlq.lock().await;
        guard.iter().cloned().collect()
    }

    pub async fn dlq_entries_for_source(&self, source: &Source) -> Vec<DlqEntry> {
        let guard = self.ctx.dlq.lock().await;
        guard
            .iter()
            .filter(|e| &e.event.source == source)
            .cloned()
            .collect()
    }

    pub async fn dlq_entries_with_status(&self, status: DlqStatus) -> Vec<DlqEntry> {
        let guard = self.ctx.dlq.lock().await;
        guard.iter().filter(|e| e.status == status).cloned().collect()
    }

    /// Operator action: re-enqueue a pending entry for exactly one more
    /// attempt. A further failure produces a fresh pending entry.
    pub async fn retry_entry(&self, id: Uuid) -> bool {
        let entry = {
            let mut guard = self.ctx.dlq.lock().await;
            match guard.iter_mut().find(|e| e.id == id && e.status == DlqStatus::Pending) {
                Some(entry) => {
                    entry.status = DlqStatus::Retried;
                    entry.retried_at = Some(Utc::now());
                    Some(entry.clone())
                }
                None => None,
            }
        };

        let Some(entry) = entry else { return false };

        self.ctx
            .audit
            .append(
                AuditRecord::new(entry.event.source.clone(), Stage::Operator, AuditOutcome::OperatorRetried)
                    .with_event_id(entry.event.event_id.clone())
                    .with_detail(format!("dlq entry {}", entry.id)),
            )
            .await;

        let attempt = entry.retry_count + 1;
        let mut policy = entry.event_policy();
        // One more attempt only: the next failure dead-letters again.
        policy.max_attempts = attempt;
        let job = RetryJob {
            event: entry.event.clone(),
            stage: Stage::Dlq,
            error: entry.error_message.clone(),
            state: RetryState::Retrying { attempt },
            policy,
        };
        if let Some(tx) = &self.sched_tx {
            let sent = tx
                .send(TimedJob {
                    ready_at: Instant::now(),
                    job,
                })
                .await
                .is_ok();
            self.ctx.notify.notify_one();
            sent
        } else {
            false
        }
    }

    /// Operator action: mark an entry handled out-of-band.
    pub async fn resolve_entry(&self, id: Uuid) -> bool {
        let resolved = {
            let mut guard = self.ctx.dlq.lock().await;
            match guard.iter_mut().find(|e| e.id == id && e.status == DlqStatus::Pending) {
                Some(entry) => {
                    entry.status = DlqStatus::Resolved;
                    entry.resolved_at = Some(Utc::now());
                    Some((entry.event.source.clone(), entry.event.event_id.clone()))
                }
                None => None,
            }
        };
        match resolved {
            Some((source, event_id)) => {
                self.ctx
                    .audit
                    .append(
                        AuditRecord::new(source, Stage::Operator, AuditOutcome::OperatorResolved)
                            .with_event_id(event_id)
                            .with_detail(format!("dlq entry {id}")),
                    )
                    .await;
                true
            }
            None => false,
        }
    }

    /// Operator action: permanently abandon an entry with a reason.
    pub async fn discard_entry(&self, id: Uuid, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let discarded = {
            let mut guard = self.ctx.dlq.lock().await;
            match guard.iter_mut().find(|e| e.id == id && e.status == DlqStatus::Pending) {
                Some(entry) => {
                    entry.status = DlqStatus::Discarded;
                    entry.discarded_at = Some(Utc::now());
                    entry.discard_reason = Some(reason.clone());
                    Some((entry.event.source.clone(), entry.event.event_id.clone()))
                }
                None => None,
            }
        };
        match discarded {
            Some((source, event_id)) => {
                self.ctx
                    .audit
                    .append(
                        AuditRecord::new(source, Stage::Operator, AuditOutcome::OperatorDiscarded)
                            .with_event_id(event_id)
                            .with_detail(reason),
                    )
                    .await;
                true
            }
            None => false,
        }
    }

    /// Stop accepting work and drain the scheduler and workers.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.sched_tx.take();
        self.ctx.notify.notify_waiters();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Submit side of a [`RetryQueue`], detached from its lifecycle.
#[derive(Clone)]
pub struct Submitter {
    ctx: Arc<RetryContext>,
}

impl Submitter {
    pub async fn submit(&self, event: CanonicalEvent, failure: StageFailure, policy: RetryPolicy) {
        submit_failure(&self.ctx, event, failure, policy).await;
    }
}

async fn submit_failure(
    ctx: &Arc<RetryContext>,
    mut event: CanonicalEvent,
    failure: StageFailure,
    policy: RetryPolicy,
) {
    event.metadata.error = Some(failure.message.clone());
    match failure.class {
        ErrorClass::Transient => {
            let job = RetryJob {
                event,
                stage: failure.stage,
                error: failure.message,
                state: RetryState::Received,
                policy,
            };
            schedule_next(ctx, job).await;
        }
        ErrorClass::Permanent | ErrorClass::Security => {
            dead_letter(ctx, event, failure.message, 0).await;
        }
    }
}

impl DlqEntry {
    /// Retry policy to apply when an operator re-enqueues this entry.
    fn event_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Schedule the attempt that follows `job.state` failing, or dead-letter
/// when attempts are exhausted.
async fn schedule_next(ctx: &Arc<RetryContext>, job: RetryJob) {
    let next = job.state.next_after_failure(job.policy.max_attempts);
    match next {
        RetryState::Retrying { attempt } => {
            let delay = jittered_delay(attempt, &job.policy);
            let ready_at = Instant::now() + delay;

            ctx.audit
                .append(
                    AuditRecord::new(job.event.source.clone(), Stage::Retry, AuditOutcome::RetryScheduled)
                        .with_event_id(job.event.event_id.clone())
                        .with_detail(format!("attempt {attempt} in {}ms: {}", delay.as_millis(), job.error)),
                )
                .await;
            ctx.counters.retries_scheduled();
            metric_inc("ingress.retry.scheduled");

            let mut event = job.event;
            event.metadata.retry_count = attempt;
            let timed = TimedJob {
                ready_at,
                job: RetryJob {
                    event,
                    stage: job.stage,
                    error: job.error,
                    state: RetryState::Retrying { attempt },
                    policy: job.policy,
                },
            };
            let _ = ctx.sched_tx.send(timed).await;
            ctx.notify.notify_one();
        }
        RetryState::DeadLettered => {
            dead_letter(ctx, job.event, job.error, job.state.attempt()).await;
        }
        // Received/Succeeded are not reachable as failure successors.
        _ => {}
    }
}

async fn dead_letter(ctx: &Arc<RetryContext>, mut event: CanonicalEvent, error: String, retry_count: u32) {
    event.metadata.retry_count = retry_count;
    event.metadata.error = Some(error.clone());

    let entry = DlqEntry {
        id: Uuid::new_v4(),
        error_message: error.clone(),
        retry_count,
        status: DlqStatus::Pending,
        created_at: Utc::now(),
        retried_at: None,
        resolved_at: None,
        discarded_at: None,
        discard_reason: None,
        event: event.clone(),
    };

    ctx.audit
        .append(
            AuditRecord::new(event.source.clone(), Stage::Dlq, AuditOutcome::DeadLettered)
                .with_event_id(event.event_id.clone())
                .with_detail(error),
        )
        .await;
    ctx.counters.dead_lettered();
    ctx.counters.source_error(&event.source);
    metric_inc("ingress.dlq.inserted");

    let dropped = {
        let mut guard = ctx.dlq.lock().await;
        guard.push_back(entry);
        let mut dropped = Vec::new();
        while guard.len() > ctx.dlq_capacity {
            // Settled entries go first; a pending entry is only ever
            // dropped with an audit trail.
            if let Some(pos) = guard.iter().position(|e| e.status != DlqStatus::Pending) {
                guard.remove(pos);
            } else if let Some(oldest) = guard.pop_front() {
                dropped.push(oldest);
            }
        }
        dropped
    };

    for old in dropped {
        ctx.counters.dlq_dropped();
        metric_inc("ingress.dlq.evicted");
        ctx.audit
            .append(
                AuditRecord::new(old.event.source.clone(), Stage::Dlq, AuditOutcome::Evicted)
                    .with_event_id(old.event.event_id.clone())
                    .with_detail(format!("pending entry {} evicted at capacity", old.id)),
            )
            .await;
    }
}

/// Retry worker loop: rate-limited, bounded by the pool size, never
/// holding queue locks across a replay.
async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<RetryJob>>>, ctx: Arc<RetryContext>) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else { break };

        if let Some(bucket) = &ctx.bucket {
            loop {
                let mut guard = bucket.lock().await;
                if guard.try_take() {
                    break;
                }
                drop(guard);
                sleep(Duration::from_millis(50)).await;
            }
        }

        let mut event = job.event.clone();
        event.metadata.retry_count = job.state.attempt();

        match ctx.executor.replay(&event).await {
            Ok(()) => {
                ctx.counters.retried_ok();
                metric_inc("ingress.retry.succeeded");
            }
            Err(failure) => {
                metric_inc("ingress.retry.failed");
                match failure.class {
                    ErrorClass::Transient => {
                        schedule_next(
                            &ctx,
                            RetryJob {
                                event: job.event,
                                stage: failure.stage,
                                error: failure.message,
                                state: job.state,
                                policy: job.policy,
                            },
                        )
                        .await;
                    }
                    ErrorClass::Permanent | ErrorClass::Security => {
                        dead_letter(&ctx, job.event, failure.message, job.state.attempt()).await;
                    }
                }
            }
        }
    }
}

/// Token bucket rate limiter for bounding outbound destination load.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let cap = capacity.max(1) as f64;
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill = elapsed * self.refill_per_sec;
        self.tokens = (self.tokens + refill).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_one_two_four_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_delay(1, &policy), Duration::from_secs(1));
        assert_eq!(retry_delay(2, &policy), Duration::from_secs(2));
        assert_eq!(retry_delay(3, &policy), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_delay(10, &policy), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = jittered_delay(3, &policy).as_millis();
            assert!((3600..=4400).contains(&d), "jittered delay {d}ms out of bounds");
        }
    }

    #[test]
    fn state_machine_dead_letters_strictly_after_final_attempt() {
        let max = 3;
        let s1 = RetryState::Received.next_after_failure(max);
        assert_eq!(s1, RetryState::Retrying { attempt: 1 });
        let s2 = s1.next_after_failure(max);
        assert_eq!(s2, RetryState::Retrying { attempt: 2 });
        let s3 = s2.next_after_failure(max);
        assert_eq!(s3, RetryState::Retrying { attempt: 3 });
        assert_eq!(s3.next_after_failure(max), RetryState::DeadLettered);
    }

    #[test]
    fn terminal_states_do_not_transition() {
        assert_eq!(
            RetryState::DeadLettered.next_after_failure(3),
            RetryState::DeadLettered
        );
        assert_eq!(RetryState::Succeeded.next_after_failure(3), RetryState::Succeeded);
    }
}
