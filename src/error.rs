use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy driving retry-vs-DLQ decisions.
///
/// Security failures are never retried and always alerted. Permanent
/// failures are never retried and go straight to the DLQ. Transient
/// failures are retried with backoff and dead-lettered only after
/// exhaustion. `NoMatch` is not an error and has no class here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Security,
    Permanent,
    Transient,
}

/// Pipeline stage a failure or audit record is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Receipt,
    Verification,
    ReplayGuard,
    SchemaValidation,
    Normalization,
    Routing,
    Invocation,
    Retry,
    Dlq,
    Operator,
}

/// Reasons signature verification rejects a delivery.
///
/// Always a permanent, security-classed error; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not a unix epoch value")]
    InvalidTimestamp,
    #[error("timestamp outside the freshness window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("missing bearer token")]
    MissingToken,
    #[error("bearer token mismatch")]
    InvalidToken,
    #[error("malformed signed envelope: {0}")]
    MalformedEnvelope(String),
}

/// One structural violation found by the schema validator.
///
/// Validation collects every violation, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub field: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Mapping failures raised by the normalizer. Always permanent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("field `{0}` is missing from the payload")]
    MissingField(String),
    #[error("field `{0}` has an unexpected shape: {1}")]
    UnexpectedShape(String, String),
}

/// Failures observed while invoking a destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("destination call timed out")]
    Timeout,
    #[error("network error reaching destination: {0}")]
    Network(String),
    #[error("destination returned status {0}")]
    Status(u16),
    #[error("destination rate limited the call")]
    RateLimited,
    #[error("no handler registered for `{0}` destinations")]
    NoHandler(&'static str),
}

impl InvokeError {
    /// Timeouts, 5xx, and 429 are transient; other 4xx are permanent.
    pub fn class(&self) -> ErrorClass {
        match self {
            InvokeError::Timeout | InvokeError::Network(_) | InvokeError::RateLimited => {
                ErrorClass::Transient
            }
            InvokeError::Status(code) => {
                if *code == 429 || *code >= 500 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            InvokeError::NoHandler(_) => ErrorClass::Permanent,
        }
    }
}

/// Errors raised by an idempotency or DLQ store backend.
///
/// Store unavailability is transient: the delivery is retried, not lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stage failure with its classification attached, handed to the
/// retry queue. The queue is the single authority deciding retry-vs-DLQ;
/// no stage retries internally.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage:?} failed ({class:?}): {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub class: ErrorClass,
    pub message: String,
}

impl StageFailure {
    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_follows_taxonomy() {
        assert_eq!(InvokeError::Status(500).class(), ErrorClass::Transient);
        assert_eq!(InvokeError::Status(503).class(), ErrorClass::Transient);
        assert_eq!(InvokeError::Status(429).class(), ErrorClass::Transient);
        assert_eq!(InvokeError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(InvokeError::Status(404).class(), ErrorClass::Permanent);
        assert_eq!(InvokeError::Status(422).class(), ErrorClass::Permanent);
    }
}
