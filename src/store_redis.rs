use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::replay::IdempotencyStore;

/// Redis-backed idempotency store.
///
/// Markers are written with a single `SET key NX EX ttl`, so the
/// check-and-set is atomic on the server and the TTL is attached in the
/// same command. Connection failures surface as transient store errors.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn marker_key(&self, key: &str) -> String {
        format!("{}:seen:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let set: Option<String> = redis::cmd("SET")
            .arg(self.marker_key(key))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(set.is_some())
    }
}
