//! Webhook ingress pipeline: receive deliveries from registered source
//! platforms, verify signatures, suppress replays, validate and
//! normalize payloads into a canonical event shape, then route each
//! event to workflow, service, or external-webhook destinations.
//!
//! Failure handling follows a strict taxonomy: security failures are
//! rejected and alerted, permanent failures dead-letter immediately,
//! transient failures retry with jittered exponential backoff before
//! dead-lettering. Every stage transition is appended to an audit log
//! that retains the original delivery bytes.
//!
//! ```no_run
//! use webhook_ingress::{
//!     DestinationSpec, Pipeline, PipelineConfig, RawDelivery, RoutingRule,
//!     SchemaDef, SourceConfig, SourceMapping, SourceRegistry,
//!     VerificationScheme,
//! };
//!
//! # async fn run() {
//! let registry = SourceRegistry::new().register(SourceConfig::new(
//!     "ghl",
//!     VerificationScheme::BearerToken {
//!         token: "secret".into(),
//!         header: "authorization".into(),
//!     },
//!     SchemaDef::new(vec![]),
//!     SourceMapping::new("type"),
//! ));
//!
//! let rules = vec![RoutingRule::new(
//!     "contact-sync",
//!     10,
//!     DestinationSpec::WorkflowTrigger {
//!         workflow_id: "sync-contact".into(),
//!         params: Default::default(),
//!     },
//! )
//! .with_event_types(vec!["contact.created"])];
//!
//! let pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     registry,
//!     rules,
//!     Default::default(),
//! );
//!
//! let delivery = RawDelivery::new("ghl", br#"{"type":"ContactCreate"}"#.to_vec())
//!     .with_header("authorization", "Bearer secret");
//! let outcome = pipeline.receive(delivery).await;
//! # let _ = outcome;
//! # }
//! ```

pub mod audit;
pub mod error;
pub mod invoke;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;
pub mod schema;
#[cfg(feature = "redis")]
pub mod store_redis;
pub mod types;
pub mod verify;

pub use audit::{AuditLog, AuditOutcome, AuditRecord, InMemoryAuditLog};
pub use error::{
    ErrorClass, InvokeError, NormalizeError, SchemaViolation, SignatureError, Stage, StageFailure,
    StoreError,
};
pub use invoke::{DestinationInvoker, ServiceCaller, WorkflowRunner};
pub use normalize::{normalize_event_type, SourceMapping};
pub use pipeline::{CountersSnapshot, Pipeline, PipelineConfig, PipelineCounters};
pub use registry::{SourceConfig, SourceRegistry};
pub use replay::{IdempotencyStore, InMemoryIdempotencyStore};
pub use retry::{
    jittered_delay, retry_delay, RetryExecutor, RetryQueue, RetryQueueConfig, RetryState,
    TokenBucket,
};
pub use router::{RouteDecision, RuleEngine, RuleSnapshot};
pub use schema::{FieldKind, FieldSpec, SchemaDef};
#[cfg(feature = "redis")]
pub use store_redis::RedisIdempotencyStore;
pub use types::{
    CanonicalEvent, CustomerId, DestinationSpec, DlqEntry, DlqStatus, EventId, EventMetadata,
    FieldPredicate, OriginalDelivery, OutboundMethod, PredicateOp, RawDelivery, ReceiptOutcome,
    RetryPolicy, RoutingRule, RuleConditions, RuleId, Source, TenantId, WebhookAuth,
};
pub use verify::{FailureWindow, VerificationScheme};
