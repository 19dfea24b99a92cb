use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::audit::{AuditLog, AuditOutcome, AuditRecord, InMemoryAuditLog};
use crate::error::{Stage, StageFailure};
use crate::invoke::DestinationInvoker;
use crate::registry::SourceRegistry;
use crate::replay::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::retry::{RetryExecutor, RetryQueue, RetryQueueConfig, TokenBucket};
use crate::router::{RouteDecision, RuleEngine};
use crate::types::{
    CanonicalEvent, DlqEntry, DlqStatus, EventId, OriginalDelivery, RawDelivery, ReceiptOutcome,
    RetryPolicy, RoutingRule, Source,
};
use crate::verify::FailureWindow;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_drop(message: &'static str, detail: &str) {
    tracing::debug!(detail, "{message}");
}

#[cfg(not(feature = "tracing"))]
fn trace_drop(_message: &'static str, _detail: &str) {}

/// Pipeline-wide tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Window within which a repeated `event_id` is a duplicate.
    pub idempotency_ttl: Duration,
    /// Maximum accepted age of a self-reported timestamp; `None`
    /// disables the freshness check for sources that don't override it.
    pub freshness_tolerance: Option<Duration>,
    /// Fallback retry policy for failures with no matched rule.
    pub default_retry: RetryPolicy,
    pub retry_queue: RetryQueueConfig,
    /// Whether `NoMatch` produces a first-class audit record (true) or
    /// only a debug log line (false).
    pub audit_no_match: bool,
    /// Optional per-source receipt rate limit.
    pub receive_max_rps: Option<u32>,
    pub receive_burst: Option<u32>,
    /// Verification failures per source within the window that flip
    /// the security alert counter.
    pub alert_failure_threshold: usize,
    pub alert_failure_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            freshness_tolerance: Some(Duration::from_secs(300)),
            default_retry: RetryPolicy::default(),
            retry_queue: RetryQueueConfig::default(),
            audit_no_match: true,
            receive_max_rps: None,
            receive_burst: None,
            alert_failure_threshold: 3,
            alert_failure_window: Duration::from_secs(300),
        }
    }
}

/// Monotonic counters for alertable conditions.
///
/// The pipeline exposes these; alerting policy (thresholds over time)
/// is an external collaborator's job.
#[derive(Default)]
pub struct PipelineCounters {
    received: AtomicU64,
    duplicates: AtomicU64,
    security_failures: AtomicU64,
    security_alerts: AtomicU64,
    schema_failures: AtomicU64,
    routed: AtomicU64,
    no_match: AtomicU64,
    delivered: AtomicU64,
    retries_scheduled: AtomicU64,
    retried_ok: AtomicU64,
    dead_lettered: AtomicU64,
    dlq_dropped: AtomicU64,
    source_errors: std::sync::Mutex<HashMap<String, u64>>,
}

impl PipelineCounters {
    pub(crate) fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn security_failure(&self) {
        self.security_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn security_alert(&self) {
        self.security_alerts.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn schema_failure(&self) {
        self.schema_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn no_match(&self) {
        self.no_match.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn retries_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn retried_ok(&self) {
        self.retried_ok.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn dlq_dropped(&self) {
        self.dlq_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn source_error(&self, source: &Source) {
        let mut guard = self.source_errors.lock().expect("counter lock");
        *guard.entry(source.0.clone()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            security_failures: self.security_failures.load(Ordering::Relaxed),
            security_alerts: self.security_alerts.load(Ordering::Relaxed),
            schema_failures: self.schema_failures.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            no_match: self.no_match.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retried_ok: self.retried_ok.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dlq_dropped: self.dlq_dropped.load(Ordering::Relaxed),
            source_errors: self.source_errors.lock().expect("counter lock").clone(),
        }
    }
}

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub received: u64,
    pub duplicates: u64,
    pub security_failures: u64,
    pub security_alerts: u64,
    pub schema_failures: u64,
    pub routed: u64,
    pub no_match: u64,
    pub delivered: u64,
    pub retries_scheduled: u64,
    pub retried_ok: u64,
    pub dead_lettered: u64,
    pub dlq_dropped: u64,
    pub source_errors: HashMap<String, u64>,
}

/// Everything a worker needs to run the pipeline tail, shared between
/// the receiver and the retry queue's executor.
pub(crate) struct PipelineCore {
    registry: SourceRegistry,
    rules: RuleEngine,
    invoker: DestinationInvoker,
    idempotency: Arc<dyn IdempotencyStore>,
    audit: Arc<dyn AuditLog>,
    counters: Arc<PipelineCounters>,
    failure_window: FailureWindow,
    receive_limiters: RwLock<HashMap<Source, Arc<Mutex<TokenBucket>>>>,
    config: PipelineConfig,
}

/// The webhook ingress pipeline.
///
/// Each inbound delivery is handled start-to-finish by the caller's
/// task; only the idempotency check-and-set and the retry queue need
/// atomicity against concurrent deliveries. The HTTP-facing `receive`
/// never waits on a destination when the matched rule is async.
pub struct Pipeline {
    core: Arc<PipelineCore>,
    retry: RetryQueue,
}

impl Pipeline {
    /// Build a pipeline with in-memory idempotency and audit backends.
    pub fn new(
        config: PipelineConfig,
        registry: SourceRegistry,
        rules: Vec<RoutingRule>,
        invoker: DestinationInvoker,
    ) -> Self {
        Self::with_stores(
            config,
            registry,
            rules,
            invoker,
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryAuditLog::new()),
        )
    }

    /// Build a pipeline over caller-supplied store and audit backends.
    pub fn with_stores(
        config: PipelineConfig,
        registry: SourceRegistry,
        rules: Vec<RoutingRule>,
        invoker: DestinationInvoker,
        idempotency: Arc<dyn IdempotencyStore>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let counters = Arc::new(PipelineCounters::default());
        let core = Arc::new(PipelineCore {
            registry,
            rules: RuleEngine::new(rules),
            invoker,
            idempotency,
            audit: audit.clone(),
            counters: counters.clone(),
            failure_window: FailureWindow::new(
                config.alert_failure_threshold,
                config.alert_failure_window,
            ),
            receive_limiters: RwLock::new(HashMap::new()),
            config: config.clone(),
        });

        let retry = RetryQueue::new(config.retry_queue.clone(), core.clone(), audit, counters);

        Self { core, retry }
    }

    /// Receive one inbound delivery.
    ///
    /// Returns the receipt-time outcome only; downstream failures are
    /// visible solely through the DLQ and audit log.
    pub async fn receive(&self, delivery: RawDelivery) -> ReceiptOutcome {
        self.core.counters.received();
        metric_inc("ingress.received");

        let Some(source_cfg) = self.core.registry.get(&delivery.source) else {
            return ReceiptOutcome::UnknownSource;
        };

        if let Some(retry_after) = self.core.check_receive_limit(&delivery.source).await {
            return ReceiptOutcome::RateLimited { retry_after };
        }

        // 1. Signature verification. Failures are security-classed:
        // never retried, audited distinctly, alerted on repetition.
        let tolerance = source_cfg
            .freshness_tolerance
            .or(self.core.config.freshness_tolerance);
        let now_secs = Utc::now().timestamp().max(0) as u64;
        if let Err(err) = source_cfg.scheme.verify(&delivery, now_secs, tolerance) {
            self.core.counters.security_failure();
            self.core.counters.source_error(&delivery.source);
            metric_inc("ingress.signature.rejected");
            if self.core.failure_window.record_failure(&delivery.source) {
                self.core.counters.security_alert();
                metric_inc("ingress.signature.alert");
            }
            self.core
                .audit
                .append(
                    AuditRecord::new(
                        delivery.source.clone(),
                        Stage::Verification,
                        AuditOutcome::SecurityViolation,
                    )
                    .with_detail(err.to_string())
                    .with_original(OriginalDelivery::from_delivery(&delivery)),
                )
                .await;
            return ReceiptOutcome::Unauthorized(err);
        }

        // 2. Parse enough of the body to extract the idempotency key.
        // An unparseable body is a schema failure, reported in full.
        let payload: serde_json::Value = match serde_json::from_slice(&delivery.body) {
            Ok(value) => value,
            Err(err) => {
                // One generated id ties the response, audit entry, and
                // DLQ entry for this delivery together.
                let event_id = EventId::generate();
                let violations = vec![crate::error::SchemaViolation::new(
                    "$",
                    format!("body is not valid JSON: {err}"),
                )];
                self.core
                    .reject_schema(&delivery, event_id.clone(), &violations)
                    .await;
                self.retry
                    .submit(
                        CanonicalEvent::skeletal(event_id, &delivery),
                        StageFailure::permanent(Stage::SchemaValidation, "body is not valid JSON"),
                        self.core.config.default_retry.clone(),
                    )
                    .await;
                return ReceiptOutcome::Invalid(violations);
            }
        };

        let event_id = match source_cfg.mapping.extract_event_id(&payload) {
            Ok(id) => id,
            Err(err) => {
                // The id field is part of the source contract; treat its
                // absence like any other structural violation.
                let event_id = EventId::generate();
                let violations = vec![crate::error::SchemaViolation::new("$", err.to_string())];
                self.core
                    .reject_schema(&delivery, event_id.clone(), &violations)
                    .await;
                self.retry
                    .submit(
                        CanonicalEvent::skeletal(event_id, &delivery),
                        StageFailure::permanent(Stage::SchemaValidation, err.to_string()),
                        self.core.config.default_retry.clone(),
                    )
                    .await;
                return ReceiptOutcome::Invalid(violations);
            }
        };

        // 3. Replay guard: atomic check-and-set keyed by source+event_id.
        let marker_key = format!("{}:{}", delivery.source.0, event_id.0);
        match self
            .core
            .idempotency
            .check_and_set(&marker_key, self.core.config.idempotency_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.core.counters.duplicate();
                metric_inc("ingress.duplicate");
                self.core
                    .audit
                    .append(
                        AuditRecord::new(
                            delivery.source.clone(),
                            Stage::ReplayGuard,
                            AuditOutcome::Duplicate,
                        )
                        .with_event_id(event_id),
                    )
                    .await;
                return ReceiptOutcome::Duplicate;
            }
            Err(err) => {
                // Store unavailability is transient: accept the delivery
                // and let the retry queue replay it. At-least-once beats
                // dropping the event.
                self.retry
                    .submit(
                        CanonicalEvent::skeletal(event_id, &delivery),
                        StageFailure::transient(Stage::ReplayGuard, err.to_string()),
                        self.core.config.default_retry.clone(),
                    )
                    .await;
                return ReceiptOutcome::Accepted;
            }
        }

        // The receipt record retains the exact headers and bytes so the
        // event can be reconstructed from the audit log alone.
        self.core
            .audit
            .append(
                AuditRecord::new(
                    delivery.source.clone(),
                    Stage::Receipt,
                    AuditOutcome::Received,
                )
                .with_event_id(event_id.clone())
                .with_original(OriginalDelivery::from_delivery(&delivery)),
            )
            .await;

        // 4. Schema validation: collect every violation; permanent.
        let violations = source_cfg.schema.validate(&payload);
        if !violations.is_empty() {
            self.core.reject_schema(&delivery, event_id.clone(), &violations).await;
            let detail = violations
                .iter()
                .map(|v| format!("{}: {}", v.field, v.message))
                .collect::<Vec<_>>()
                .join("; ");
            self.retry
                .submit(
                    CanonicalEvent::skeletal(event_id, &delivery),
                    StageFailure::permanent(Stage::SchemaValidation, detail),
                    self.core.config.default_retry.clone(),
                )
                .await;
            return ReceiptOutcome::Invalid(violations);
        }

        // 5. Normalize. Mapping failures are permanent.
        let mut event = match source_cfg.mapping.normalize(&delivery, &payload) {
            Ok(event) => event,
            Err(err) => {
                self.core.counters.source_error(&delivery.source);
                self.retry
                    .submit(
                        CanonicalEvent::skeletal(event_id, &delivery),
                        StageFailure::permanent(Stage::Normalization, err.to_string()),
                        self.core.config.default_retry.clone(),
                    )
                    .await;
                return ReceiptOutcome::Accepted;
            }
        };
        event.metadata.signature_verified = true;
        event.metadata.schema_valid = true;
        self.core
            .audit
            .append(
                AuditRecord::new(
                    event.source.clone(),
                    Stage::Normalization,
                    AuditOutcome::Normalized,
                )
                .with_event_id(event.event_id.clone())
                .with_detail(event.event_type.clone()),
            )
            .await;

        // 6. Route and invoke.
        let snapshot = self.core.rules.snapshot().await;
        match snapshot.route(&event) {
            RouteDecision::NoMatch => {
                self.core.handle_no_match(&event).await;
                ReceiptOutcome::Accepted
            }
            RouteDecision::Matched(rule) => {
                self.core.counters.routed();
                metric_inc("ingress.routed");
                self.core
                    .audit
                    .append(
                        AuditRecord::new(event.source.clone(), Stage::Routing, AuditOutcome::Routed)
                            .with_event_id(event.event_id.clone())
                            .with_detail(format!("rule {}", rule.id.0)),
                    )
                    .await;

                if rule.dispatch_async {
                    let core = self.core.clone();
                    let submitter = self.retry.submitter();
                    tokio::spawn(async move {
                        if let Err(failure) = core.invoke_and_settle(&rule, event.clone()).await {
                            submitter.submit(event, failure, rule.retry.clone()).await;
                        }
                    });
                    ReceiptOutcome::Accepted
                } else {
                    match self.core.invoke_and_settle(&rule, event.clone()).await {
                        Ok(()) => ReceiptOutcome::Processed,
                        Err(failure) => {
                            // The caller still sees acceptance; the failure
                            // lives in the retry queue and audit log.
                            self.retry.submit(event, failure, rule.retry.clone()).await;
                            ReceiptOutcome::Accepted
                        }
                    }
                }
            }
        }
    }

    /// Publish a new routing rule set; takes effect on the next cycle.
    pub async fn reload_rules(&self, rules: Vec<RoutingRule>) {
        self.core.rules.reload(rules).await;
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.core.counters.snapshot()
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.core.audit
    }

    pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
        self.retry.dlq_entries().await
    }

    pub async fn dlq_entries_for_source(&self, source: &Source) -> Vec<DlqEntry> {
        self.retry.dlq_entries_for_source(source).await
    }

    pub async fn dlq_entries_with_status(&self, status: DlqStatus) -> Vec<DlqEntry> {
        self.retry.dlq_entries_with_status(status).await
    }

    /// Operator action: re-enqueue a pending DLQ entry for exactly one
    /// more attempt.
    pub async fn retry_dlq_entry(&self, id: uuid::Uuid) -> bool {
        self.retry.retry_entry(id).await
    }

    /// Operator action: mark a pending DLQ entry handled out-of-band.
    pub async fn resolve_dlq_entry(&self, id: uuid::Uuid) -> bool {
        self.retry.resolve_entry(id).await
    }

    /// Operator action: permanently abandon a pending DLQ entry.
    pub async fn discard_dlq_entry(&self, id: uuid::Uuid, reason: impl Into<String>) -> bool {
        self.retry.discard_entry(id, reason).await
    }

    /// Drain the retry queue and stop its workers.
    pub async fn shutdown(&mut self) {
        self.retry.shutdown().await;
    }
}

impl PipelineCore {
    /// Invoke the destination and settle the event on success.
    async fn invoke_and_settle(
        &self,
        rule: &RoutingRule,
        mut event: CanonicalEvent,
    ) -> Result<(), StageFailure> {
        match self.invoker.invoke(rule, &event).await {
            Ok(()) => {
                event.processed_at = Some(Utc::now());
                self.counters.delivered();
                metric_inc("ingress.delivered");
                self.audit
                    .append(
                        AuditRecord::new(
                            event.source.clone(),
                            Stage::Invocation,
                            AuditOutcome::Processed,
                        )
                        .with_event_id(event.event_id.clone())
                        .with_detail(format!(
                            "rule {} -> {}",
                            rule.id.0,
                            rule.destination.kind()
                        )),
                    )
                    .await;
                Ok(())
            }
            Err(err) => {
                self.counters.source_error(&event.source);
                Err(StageFailure {
                    stage: Stage::Invocation,
                    class: err.class(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn handle_no_match(&self, event: &CanonicalEvent) {
        self.counters.no_match();
        metric_inc("ingress.no_match");
        if self.config.audit_no_match {
            self.audit
                .append(
                    AuditRecord::new(event.source.clone(), Stage::Routing, AuditOutcome::NoMatch)
                        .with_event_id(event.event_id.clone())
                        .with_detail(event.event_type.clone()),
                )
                .await;
        } else {
            trace_drop("event matched no routing rule", &event.event_type);
        }
    }

    async fn reject_schema(
        &self,
        delivery: &RawDelivery,
        event_id: EventId,
        violations: &[crate::error::SchemaViolation],
    ) {
        self.counters.schema_failure();
        self.counters.source_error(&delivery.source);
        metric_inc("ingress.schema.rejected");
        let detail = violations
            .iter()
            .map(|v| format!("{}: {}", v.field, v.message))
            .collect::<Vec<_>>()
            .join("; ");
        self.audit
            .append(
                AuditRecord::new(
                    delivery.source.clone(),
                    Stage::SchemaValidation,
                    AuditOutcome::Rejected,
                )
                .with_event_id(event_id)
                .with_detail(detail)
                .with_original(OriginalDelivery::from_delivery(delivery)),
            )
            .await;
    }

    async fn check_receive_limit(&self, source: &Source) -> Option<Duration> {
        let max_rps = self.config.receive_max_rps?;
        let bucket = {
            let guard = self.receive_limiters.read().await;
            guard.get(source).cloned()
        };
        let bucket = match bucket {
            Some(bucket) => bucket,
            None => {
                let mut guard = self.receive_limiters.write().await;
                guard
                    .entry(source.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(TokenBucket::new(
                            self.config.receive_burst.unwrap_or(max_rps),
                            max_rps,
                        )))
                    })
                    .clone()
            }
        };
        let mut guard = bucket.lock().await;
        if guard.try_take() {
            None
        } else {
            Some(Duration::from_secs(1))
        }
    }
}

#[async_trait::async_trait]
impl RetryExecutor for PipelineCore {
    /// Re-enter the pipeline at the Normalizer stage from the retained
    /// original bytes, then route and invoke against the current rule
    /// snapshot.
    async fn replay(&self, event: &CanonicalEvent) -> Result<(), StageFailure> {
        let Some(source_cfg) = self.registry.get(&event.source) else {
            return Err(StageFailure::permanent(
                Stage::Normalization,
                format!("source `{}` is no longer registered", event.source.0),
            ));
        };

        let payload: serde_json::Value = serde_json::from_slice(&event.original.body)
            .map_err(|e| StageFailure::permanent(Stage::Normalization, e.to_string()))?;

        let delivery = RawDelivery {
            source: event.source.clone(),
            method: "POST".to_string(),
            path: format!("/webhooks/{}", event.source.0),
            headers: event.original.headers.clone(),
            body: event.original.body.clone(),
            received_at: event.received_at,
        };

        let mut replayed = source_cfg
            .mapping
            .normalize(&delivery, &payload)
            .map_err(|e| StageFailure::permanent(Stage::Normalization, e.to_string()))?;
        replayed.metadata.signature_verified = true;
        replayed.metadata.schema_valid = true;
        replayed.metadata.retry_count = event.metadata.retry_count;

        let snapshot = self.rules.snapshot().await;
        match snapshot.route(&replayed) {
            RouteDecision::NoMatch => {
                self.handle_no_match(&replayed).await;
                Ok(())
            }
            RouteDecision::Matched(rule) => self.invoke_and_settle(&rule, replayed).await,
        }
    }
}
