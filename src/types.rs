use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SchemaViolation, SignatureError};

/// Identifier of a registered source platform.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of source tags with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source(pub String);

impl Source {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

/// Unique identifier for an event, used as the idempotency key.
///
/// Platform-supplied where the source mapping names a field for it,
/// otherwise a generated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Unique identifier for a customer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

/// Unique identifier for a routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

/// The untouched inbound request as received from a platform.
///
/// Immutable after creation. The raw body is preserved inside
/// [`CanonicalEvent::original`] so audit and DLQ replay always work
/// from the exact bytes that were signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDelivery {
    pub source: Source,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawDelivery {
    /// Create a delivery for `POST /webhooks/{source}` with the given body.
    pub fn new(source: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let source = Source(source.into());
        let path = format!("/webhooks/{}", source.0);
        Self {
            source,
            method: "POST".to_string(),
            path,
            headers: HashMap::new(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == wanted)
            .map(|(_, v)| v.as_str())
    }
}

/// Headers and raw body retained verbatim for audit and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalDelivery {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl OriginalDelivery {
    pub fn from_delivery(delivery: &RawDelivery) -> Self {
        Self {
            headers: delivery.headers.clone(),
            body: delivery.body.clone(),
        }
    }
}

/// Processing provenance, mutated only by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    pub signature_verified: bool,
    pub schema_valid: bool,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// The normalized, source-agnostic representation of a webhook payload.
///
/// Owned exclusively by the single worker processing it; never shared
/// mutably across deliveries. `event_id` is write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: EventId,
    pub source: Source,
    /// Normalized `verb.noun` form, e.g. `contact.created`.
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    /// Set only after successful routing and delivery.
    pub processed_at: Option<DateTime<Utc>>,
    pub tenant_id: Option<TenantId>,
    pub customer_id: Option<CustomerId>,
    /// Open map of normalized fields.
    pub data: serde_json::Map<String, serde_json::Value>,
    pub original: OriginalDelivery,
    pub metadata: EventMetadata,
}

impl CanonicalEvent {
    /// A minimal event for failures that occur before normalization
    /// succeeds, so the DLQ record still retains the original bytes.
    pub fn skeletal(event_id: EventId, delivery: &RawDelivery) -> Self {
        Self {
            event_id,
            source: delivery.source.clone(),
            event_type: String::new(),
            received_at: delivery.received_at,
            processed_at: None,
            tenant_id: None,
            customer_id: None,
            data: serde_json::Map::new(),
            original: OriginalDelivery::from_delivery(delivery),
            metadata: EventMetadata::default(),
        }
    }
}

/// Comparison operator allowed in rule predicates.
///
/// The predicate language is deliberately restricted to field equality
/// and ordering so rule evaluation stays bounded and auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A single comparison against a field of `CanonicalEvent::data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPredicate {
    /// Dotted path into `data`, e.g. `contact.plan`.
    pub field: String,
    pub op: PredicateOp,
    pub value: serde_json::Value,
}

/// Conjunctive match conditions for a routing rule.
///
/// Empty lists mean "no constraint on this dimension".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    pub sources: Vec<Source>,
    pub event_types: Vec<String>,
    pub tenants: Vec<TenantId>,
    pub predicate: Option<FieldPredicate>,
}

/// HTTP method allowed for external webhook destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboundMethod {
    Post,
    Put,
}

/// Auth attached to external webhook calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WebhookAuth {
    Bearer(String),
    Header { name: String, value: String },
}

/// Where a matched event is delivered.
///
/// All three shapes are invoked through the same capability interface;
/// the router never branches on shape beyond selecting the implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DestinationSpec {
    /// Invoke a named workflow by id with a parameter map.
    WorkflowTrigger {
        workflow_id: String,
        params: serde_json::Map<String, serde_json::Value>,
    },
    /// Call a named internal service method with a parameter map.
    ServiceCall {
        service: String,
        method: String,
        params: serde_json::Map<String, serde_json::Value>,
    },
    /// HTTP POST/PUT to a configured external URL.
    ExternalWebhook {
        url: String,
        method: OutboundMethod,
        auth: Option<WebhookAuth>,
    },
}

impl DestinationSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationSpec::WorkflowTrigger { .. } => "workflow",
            DestinationSpec::ServiceCall { .. } => "service",
            DestinationSpec::ExternalWebhook { .. } => "external-webhook",
        }
    }
}

/// Backoff parameters for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2,
            max_attempts: 3,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A priority-ordered predicate-to-destination mapping.
///
/// Rules are loaded into an immutable snapshot per routing cycle;
/// updates take effect only on the next reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    /// Lower sorts first. Ties break by registration order.
    pub priority: u32,
    pub conditions: RuleConditions,
    pub destination: DestinationSpec,
    /// When true the delivery is decoupled from the HTTP response.
    pub dispatch_async: bool,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub enabled: bool,
}

impl RoutingRule {
    pub fn new(id: impl Into<String>, priority: u32, destination: DestinationSpec) -> Self {
        Self {
            id: RuleId(id.into()),
            priority,
            conditions: RuleConditions::default(),
            destination,
            dispatch_async: true,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            enabled: true,
        }
    }

    pub fn with_sources(mut self, sources: Vec<&str>) -> Self {
        self.conditions.sources = sources.into_iter().map(Source::new).collect();
        self
    }

    pub fn with_event_types(mut self, event_types: Vec<&str>) -> Self {
        self.conditions.event_types = event_types.into_iter().map(String::from).collect();
        self
    }

    pub fn with_tenants(mut self, tenants: Vec<&str>) -> Self {
        self.conditions.tenants = tenants.into_iter().map(|t| TenantId(t.into())).collect();
        self
    }

    pub fn with_predicate(
        mut self,
        field: impl Into<String>,
        op: PredicateOp,
        value: serde_json::Value,
    ) -> Self {
        self.conditions.predicate = Some(FieldPredicate {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn with_sync_dispatch(mut self) -> Self {
        self.dispatch_async = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Disposition of a dead-lettered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqStatus {
    Pending,
    Retried,
    Resolved,
    Discarded,
}

/// Durable record of an event that exhausted retries or failed permanently.
///
/// Created only by the retry queue; mutated only through operator actions
/// or automated re-enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub event: CanonicalEvent,
    pub error_message: String,
    pub retry_count: u32,
    pub status: DlqStatus,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub discard_reason: Option<String>,
}

/// What the original HTTP caller sees at receipt time.
///
/// Downstream failures are visible solely through the DLQ and audit log,
/// never through this value. Hosts map variants onto response codes:
/// `Accepted` 202, `Processed`/`Duplicate` 200, `Invalid` 400,
/// `Unauthorized` 401, `UnknownSource` 404, `RateLimited` 429.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Accepted for asynchronous processing.
    Accepted,
    /// Synchronous rule delivered before the response was returned.
    Processed,
    /// Already processed within the idempotency TTL window.
    Duplicate,
    /// Schema validation failed; all violations are returned.
    Invalid(Vec<SchemaViolation>),
    /// Signature or replay check failed. Never retried.
    Unauthorized(SignatureError),
    /// No source registered under the request path.
    UnknownSource,
    /// Receipt-side rate limit tripped.
    RateLimited { retry_after: Duration },
}
