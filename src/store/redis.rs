//! Redis-backed sample store
//!
//! Shares health state across processes. Each endpoint owns two lists,
//! `latency:<endpoint>` and `status:<endpoint>`, newest-first, each entry a
//! JSON-encoded sample. Samples surviving a restart warm-start the oracle but
//! are never required for correctness.

use super::{LatencySample, SampleStore, StatusSample, now_ms};
use crate::endpoint::EndpointId;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const LATENCY_PREFIX: &str = "latency:";
const STATUS_PREFIX: &str = "status:";

/// Sample store backed by Redis lists
pub struct RedisStore {
    conn: MultiplexedConnection,
    max_samples: usize,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(address: &str, db: i64, max_samples: usize) -> RelayResult<Self> {
        tracing::info!(db = db, "Connecting to Redis sample store");

        let client = redis::Client::open(address)
            .map_err(|e| RelayError::Store(format!("invalid Redis address: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RelayError::Store(format!("Redis connection failed: {}", e)))?;

        if db != 0 {
            redis::cmd("SELECT")
                .arg(db)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| RelayError::Store(format!("SELECT {} failed: {}", db, e)))?;
        }

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("PING failed: {}", e)))?;
        if pong != "PONG" {
            return Err(RelayError::Store(format!(
                "unexpected PING response: {}",
                pong
            )));
        }

        tracing::info!("Redis sample store connection established");
        Ok(Self {
            conn,
            max_samples: max_samples.max(1),
        })
    }

    async fn push<T: Serialize>(&self, key: &str, sample: &T) -> RelayResult<()> {
        let encoded = serde_json::to_string(sample)
            .map_err(|e| RelayError::Store(format!("sample encoding failed: {}", e)))?;

        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(encoded)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("LPUSH {} failed: {}", key, e)))?;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(self.max_samples as isize - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("LTRIM {} failed: {}", key, e)))?;
        Ok(())
    }

    async fn range<T: DeserializeOwned>(&self, key: &str, n: usize) -> RelayResult<Vec<T>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(n as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("LRANGE {} failed: {}", key, e)))?;

        let mut samples = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable sample entry");
                }
            }
        }
        Ok(samples)
    }

    /// Trim a list to entries at least as new as `cutoff`
    ///
    /// Entries are newest-first, so ages ascend with index; the first expired
    /// index marks the cut. A concurrent LPUSH between the read and the trim
    /// can leave one expired entry behind, which the next pass removes.
    async fn evict_key(&self, key: &str, cutoff: i64) -> RelayResult<usize> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("LRANGE {} failed: {}", key, e)))?;

        let timestamp_of = |entry: &str| -> i64 {
            serde_json::from_str::<serde_json::Value>(entry)
                .ok()
                .and_then(|v| v.get("timestamp_ms").and_then(|t| t.as_i64()))
                .unwrap_or(i64::MIN)
        };

        let keep = raw
            .iter()
            .position(|entry| timestamp_of(entry) < cutoff)
            .unwrap_or(raw.len());
        let expired = raw.len() - keep;
        if expired == 0 {
            return Ok(0);
        }

        if keep == 0 {
            redis::cmd("DEL")
                .arg(key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| RelayError::Store(format!("DEL {} failed: {}", key, e)))?;
        } else {
            redis::cmd("LTRIM")
                .arg(key)
                .arg(0)
                .arg(keep as isize - 1)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| RelayError::Store(format!("LTRIM {} failed: {}", key, e)))?;
        }
        Ok(expired)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Store(format!("KEYS {}* failed: {}", prefix, e)))?;
        Ok(keys)
    }
}

#[async_trait]
impl SampleStore for RedisStore {
    async fn append_latency(
        &self,
        endpoint: &EndpointId,
        sample: LatencySample,
    ) -> RelayResult<()> {
        self.push(&format!("{}{}", LATENCY_PREFIX, endpoint), &sample)
            .await
    }

    async fn append_status(&self, endpoint: &EndpointId, sample: StatusSample) -> RelayResult<()> {
        self.push(&format!("{}{}", STATUS_PREFIX, endpoint), &sample)
            .await
    }

    async fn recent_latencies(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<LatencySample>> {
        self.range(&format!("{}{}", LATENCY_PREFIX, endpoint), n)
            .await
    }

    async fn recent_statuses(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<StatusSample>> {
        self.range(&format!("{}{}", STATUS_PREFIX, endpoint), n)
            .await
    }

    async fn evict_older_than(
        &self,
        endpoint: &EndpointId,
        horizon: Duration,
    ) -> RelayResult<usize> {
        let cutoff = now_ms() - horizon.as_millis() as i64;
        let latency_removed = self
            .evict_key(&format!("{}{}", LATENCY_PREFIX, endpoint), cutoff)
            .await?;
        let status_removed = self
            .evict_key(&format!("{}{}", STATUS_PREFIX, endpoint), cutoff)
            .await?;
        Ok(latency_removed + status_removed)
    }

    async fn endpoints(&self) -> RelayResult<Vec<EndpointId>> {
        let mut names = std::collections::HashSet::new();
        for key in self.keys_with_prefix(LATENCY_PREFIX).await? {
            if let Some(name) = key.strip_prefix(LATENCY_PREFIX) {
                names.insert(name.to_string());
            }
        }
        for key in self.keys_with_prefix(STATUS_PREFIX).await? {
            if let Some(name) = key.strip_prefix(STATUS_PREFIX) {
                names.insert(name.to_string());
            }
        }

        let mut endpoints = Vec::with_capacity(names.len());
        for name in names {
            match EndpointId::parse(&name) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    tracing::warn!(key = %name, error = %e, "Skipping unparseable endpoint key");
                }
            }
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Connection-dependent behavior is covered by deployments with a live
    // Redis; these tests pin the key scheme and entry encoding.

    #[test]
    fn test_key_scheme() {
        let endpoint = EndpointId::parse("vertex/gemini-pro/us-east4").expect("parse");
        assert_eq!(
            format!("{}{}", LATENCY_PREFIX, endpoint),
            "latency:vertex/gemini-pro/us-east4"
        );
        assert_eq!(
            format!("{}{}", STATUS_PREFIX, endpoint),
            "status:vertex/gemini-pro/us-east4"
        );
    }

    #[test]
    fn test_sample_entry_encoding_round_trips() {
        let sample = LatencySample {
            timestamp_ms: 1_700_000_000_000,
            seconds: 0.42,
            outcome: super::super::LatencyOutcome::Failed,
        };
        let encoded = serde_json::to_string(&sample).expect("encode");
        assert!(encoded.contains("\"timestamp_ms\":1700000000000"));
        assert!(encoded.contains("\"failed\""));

        let decoded: LatencySample = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, sample);
    }
}
