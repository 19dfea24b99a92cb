use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::SignatureError;
use crate::types::{RawDelivery, Source};

/// Per-source authentication scheme, selected by the inbound path.
///
/// Each registered source carries exactly one scheme; adding a source
/// means registering a scheme, not touching the pipeline.
#[derive(Debug, Clone)]
pub enum VerificationScheme {
    /// HMAC-SHA256 over the raw body, hex-encoded in a header.
    /// When `timestamp_header` is set the timestamp is prepended to the
    /// signed data and checked for freshness.
    HmacSha256 {
        secret: Vec<u8>,
        signature_header: String,
        timestamp_header: Option<String>,
    },
    /// Shared-secret equality against a header value. Accepts either the
    /// raw secret or a `Bearer <secret>` form.
    BearerToken { token: String, header: String },
    /// Provider-specific signed envelope: the JSON body carries the
    /// payload under one field and a hex HMAC-SHA256 of that payload's
    /// serialized bytes under another.
    SignedEnvelope {
        secret: Vec<u8>,
        payload_field: String,
        signature_field: String,
    },
}

impl VerificationScheme {
    /// Authenticate a raw delivery.
    ///
    /// `tolerance` bounds the self-reported timestamp age for schemes that
    /// carry one; `None` disables the freshness check.
    pub fn verify(
        &self,
        delivery: &RawDelivery,
        now_secs: u64,
        tolerance: Option<Duration>,
    ) -> Result<(), SignatureError> {
        match self {
            VerificationScheme::HmacSha256 {
                secret,
                signature_header,
                timestamp_header,
            } => {
                let provided = delivery
                    .header(signature_header)
                    .ok_or(SignatureError::MissingSignature)?;

                let timestamp = match timestamp_header {
                    Some(name) => {
                        let raw = delivery
                            .header(name)
                            .ok_or(SignatureError::MissingTimestamp)?;
                        let secs = raw
                            .parse::<u64>()
                            .map_err(|_| SignatureError::InvalidTimestamp)?;
                        if let Some(max_age) = tolerance {
                            if !is_timestamp_fresh(secs, now_secs, max_age.as_secs()) {
                                return Err(SignatureError::StaleTimestamp);
                            }
                        }
                        Some(raw.to_string())
                    }
                    None => None,
                };

                if verify_signature(secret, &delivery.body, timestamp.as_deref(), provided) {
                    Ok(())
                } else {
                    Err(SignatureError::InvalidSignature)
                }
            }

            VerificationScheme::BearerToken { token, header } => {
                let raw = delivery.header(header).ok_or(SignatureError::MissingToken)?;
                let provided = raw.strip_prefix("Bearer ").unwrap_or(raw);
                if constant_time_eq(provided.as_bytes(), token.as_bytes()) {
                    Ok(())
                } else {
                    Err(SignatureError::InvalidToken)
                }
            }

            VerificationScheme::SignedEnvelope {
                secret,
                payload_field,
                signature_field,
            } => {
                let envelope: serde_json::Value = serde_json::from_slice(&delivery.body)
                    .map_err(|e| SignatureError::MalformedEnvelope(e.to_string()))?;
                let payload = envelope.get(payload_field).ok_or_else(|| {
                    SignatureError::MalformedEnvelope(format!("missing `{payload_field}`"))
                })?;
                let provided = envelope
                    .get(signature_field)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        SignatureError::MalformedEnvelope(format!("missing `{signature_field}`"))
                    })?;

                let bytes = serde_json::to_vec(payload)
                    .map_err(|e| SignatureError::MalformedEnvelope(e.to_string()))?;
                if verify_signature(secret, &bytes, None, provided) {
                    Ok(())
                } else {
                    Err(SignatureError::InvalidSignature)
                }
            }
        }
    }
}

/// Compute the hex HMAC-SHA256 signature a source is expected to send.
///
/// With a timestamp, the signed data is `timestamp || payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received hex signature with optional timestamp binding.
///
/// `Mac::verify_slice` compares tags in constant time.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);

    mac.verify_slice(&signature).is_ok()
}

/// Constant-time equality for values of arbitrary, possibly unequal
/// length. Both sides are hashed to a fixed-width digest first so the
/// comparison cost never depends on where the inputs diverge or on
/// their lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let da = Sha256::digest(a);
    let db = Sha256::digest(b);
    da.ct_eq(&db).into()
}

/// Reject self-reported timestamps older than `max_age_secs` (or from
/// the future) to close replay attacks independent of the idempotency
/// cache.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

/// Sliding window over per-source verification failures.
///
/// `record_failure` returns true when the source crosses the alert
/// threshold within the window; the pipeline surfaces that as a counter,
/// alert policy itself lives with an external collaborator.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    threshold: usize,
    failures: Mutex<HashMap<Source, VecDeque<Instant>>>,
}

impl FailureWindow {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            window,
            threshold,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, source: &Source) -> bool {
        let now = Instant::now();
        let mut guard = self.failures.lock().expect("failure window lock");
        let entries = guard.entry(source.clone()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) > self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries.push_back(now);
        entries.len() >= self.threshold
    }

    pub fn failure_count(&self, source: &Source) -> usize {
        let guard = self.failures.lock().expect("failure window lock");
        guard.get(source).map(|e| e.len()).unwrap_or(0)
    }
}
