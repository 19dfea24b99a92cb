use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

/// Shared key-value store with TTL backing the replay guard.
///
/// Implementations must make `check_and_set` atomic so two concurrent
/// deliveries of the same `event_id` can never both proceed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically check-and-set a marker for `key`.
    ///
    /// Returns `true` if the key was unseen and the marker is now set,
    /// `false` if a live marker already exists (duplicate delivery).
    /// Store unavailability is a transient error, not a duplicate.
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// In-memory TTL store for single-process deployments and tests.
///
/// The whole map is guarded by one mutex, which is what makes the
/// check-and-set atomic. Expired markers are swept opportunistically.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    markers: Mutex<HashMap<String, Instant>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut guard = self.markers.lock().await;

        guard.retain(|_, expires_at| *expires_at > now);

        if guard.contains_key(key) {
            return Ok(false);
        }
        guard.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_check_is_duplicate() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.check_and_set("ghl:evt_1", ttl).await.unwrap());
        assert!(!store.check_and_set("ghl:evt_1", ttl).await.unwrap());
        assert!(store.check_and_set("ghl:evt_2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn marker_expires_after_ttl() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_millis(20);
        assert!(store.check_and_set("ghl:evt_1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.check_and_set("ghl:evt_1", ttl).await.unwrap());
    }
}
