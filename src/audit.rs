use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Stage;
use crate::types::{EventId, OriginalDelivery, Source};

/// What an audit record says happened at its stage.
///
/// `SecurityViolation` is distinct from processing failures: signature
/// and replay rejections never produce a retry-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Received,
    SecurityViolation,
    Duplicate,
    Rejected,
    Normalized,
    Routed,
    NoMatch,
    Processed,
    RetryScheduled,
    DeadLettered,
    Evicted,
    OperatorRetried,
    OperatorResolved,
    OperatorDiscarded,
}

/// One append-only audit entry.
///
/// `event_id` is absent for security violations rejected before the
/// payload was parsed. Receipt records retain the original headers and
/// body so the event can be reconstructed byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Option<EventId>,
    pub source: Source,
    pub stage: Stage,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub original: Option<OriginalDelivery>,
}

impl AuditRecord {
    pub fn new(source: Source, stage: Stage, outcome: AuditOutcome) -> Self {
        Self {
            event_id: None,
            source,
            stage,
            outcome,
            detail: None,
            recorded_at: Utc::now(),
            original: None,
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_original(mut self, original: OriginalDelivery) -> Self {
        self.original = Some(original);
        self
    }
}

/// Append-only audit log consumed by the DLQ dashboard and compliance
/// queries (external collaborators). The pipeline only ever appends.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: AuditRecord);
    async fn records_for(&self, event_id: &EventId) -> Vec<AuditRecord>;
    async fn records(&self) -> Vec<AuditRecord>;
}

/// In-memory audit log for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, record: AuditRecord) {
        self.records.lock().await.push(record);
    }

    async fn records_for(&self, event_id: &EventId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.event_id.as_ref() == Some(event_id))
            .cloned()
            .collect()
    }

    async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}
