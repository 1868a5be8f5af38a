//! In-memory sample store
//!
//! Per-endpoint ring buffers behind an async RwLock. Suitable for tests and
//! single-process deployments; health state is lost on restart.

use super::{LatencySample, SampleStore, StatusSample, now_ms};
use crate::endpoint::EndpointId;
use crate::error::RelayResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct EndpointSamples {
    latencies: VecDeque<LatencySample>,
    statuses: VecDeque<StatusSample>,
}

/// Sample store backed by per-endpoint ring buffers
#[derive(Debug)]
pub struct MemoryStore {
    max_samples: usize,
    inner: RwLock<HashMap<EndpointId, EndpointSamples>>,
}

impl MemoryStore {
    /// Create a store retaining at most `max_samples` per endpoint, per kind
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            inner: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn append_latency(
        &self,
        endpoint: &EndpointId,
        sample: LatencySample,
    ) -> RelayResult<()> {
        let mut inner = self.inner.write().await;
        let samples = inner.entry(endpoint.clone()).or_default();
        samples.latencies.push_back(sample);
        while samples.latencies.len() > self.max_samples {
            samples.latencies.pop_front();
        }
        Ok(())
    }

    async fn append_status(&self, endpoint: &EndpointId, sample: StatusSample) -> RelayResult<()> {
        let mut inner = self.inner.write().await;
        let samples = inner.entry(endpoint.clone()).or_default();
        samples.statuses.push_back(sample);
        while samples.statuses.len() > self.max_samples {
            samples.statuses.pop_front();
        }
        Ok(())
    }

    async fn recent_latencies(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<LatencySample>> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(endpoint)
            .map(|s| s.latencies.iter().rev().take(n).copied().collect())
            .unwrap_or_default())
    }

    async fn recent_statuses(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<StatusSample>> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(endpoint)
            .map(|s| s.statuses.iter().rev().take(n).copied().collect())
            .unwrap_or_default())
    }

    async fn evict_older_than(
        &self,
        endpoint: &EndpointId,
        horizon: Duration,
    ) -> RelayResult<usize> {
        let cutoff = now_ms() - horizon.as_millis() as i64;
        let mut inner = self.inner.write().await;
        let Some(samples) = inner.get_mut(endpoint) else {
            return Ok(0);
        };

        let before = samples.latencies.len() + samples.statuses.len();
        // Samples are time-ascending, so expired entries sit at the front.
        while samples
            .latencies
            .front()
            .is_some_and(|s| s.timestamp_ms < cutoff)
        {
            samples.latencies.pop_front();
        }
        while samples
            .statuses
            .front()
            .is_some_and(|s| s.timestamp_ms < cutoff)
        {
            samples.statuses.pop_front();
        }
        Ok(before - samples.latencies.len() - samples.statuses.len())
    }

    async fn endpoints(&self) -> RelayResult<Vec<EndpointId>> {
        let inner = self.inner.read().await;
        Ok(inner.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::LatencyOutcome;
    use super::*;

    fn endpoint(s: &str) -> EndpointId {
        EndpointId::parse(s).expect("should parse endpoint")
    }

    #[tokio::test]
    async fn test_recent_latencies_newest_first_bounded() {
        let store = MemoryStore::new(100);
        let e = endpoint("openai/gpt-4");

        for i in 0..5 {
            store
                .append_latency(
                    &e,
                    LatencySample {
                        timestamp_ms: 1000 + i,
                        seconds: i as f64,
                        outcome: LatencyOutcome::Success,
                    },
                )
                .await
                .expect("append");
        }

        let recent = store.recent_latencies(&e, 3).await.expect("query");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].seconds, 4.0);
        assert_eq!(recent[2].seconds, 2.0);
    }

    #[tokio::test]
    async fn test_ring_buffer_caps_sample_count() {
        let store = MemoryStore::new(3);
        let e = endpoint("openai/gpt-4");

        for i in 0..10 {
            store
                .append_status(
                    &e,
                    StatusSample {
                        timestamp_ms: i,
                        status: 200,
                    },
                )
                .await
                .expect("append");
        }

        let recent = store.recent_statuses(&e, 100).await.expect("query");
        assert_eq!(recent.len(), 3);
        // Oldest retained sample is the 8th append
        assert_eq!(recent[2].timestamp_ms, 7);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_returns_empty() {
        let store = MemoryStore::new(10);
        let recent = store
            .recent_latencies(&endpoint("openai/unknown"), 5)
            .await
            .expect("query");
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_evict_older_than_removes_only_expired() {
        let store = MemoryStore::new(100);
        let e = endpoint("azure/gpt-4");

        store
            .append_latency(
                &e,
                LatencySample {
                    timestamp_ms: now_ms() - 120_000,
                    seconds: 1.0,
                    outcome: LatencyOutcome::Failed,
                },
            )
            .await
            .expect("append");
        store
            .append_status(
                &e,
                StatusSample {
                    timestamp_ms: now_ms() - 120_000,
                    status: 500,
                },
            )
            .await
            .expect("append");
        store
            .append_latency(&e, LatencySample::now(0.1, LatencyOutcome::Success))
            .await
            .expect("append");

        let removed = store
            .evict_older_than(&e, Duration::from_secs(60))
            .await
            .expect("evict");
        assert_eq!(removed, 2);

        assert_eq!(store.recent_latencies(&e, 10).await.expect("query").len(), 1);
        assert!(store.recent_statuses(&e, 10).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_endpoints_enumerates_all_keys() {
        let store = MemoryStore::new(10);
        store
            .append_latency(
                &endpoint("openai/gpt-4"),
                LatencySample::now(0.1, LatencyOutcome::Success),
            )
            .await
            .expect("append");
        store
            .append_status(&endpoint("azure/gpt-4"), StatusSample::now(200))
            .await
            .expect("append");

        let mut endpoints = store.endpoints().await.expect("endpoints");
        endpoints.sort_by_key(|e| e.to_string());
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], endpoint("azure/gpt-4"));
    }

    #[tokio::test]
    async fn test_read_your_writes_on_same_endpoint() {
        let store = MemoryStore::new(10);
        let e = endpoint("openai/gpt-4");

        store
            .append_status(&e, StatusSample::now(429))
            .await
            .expect("append");
        let recent = store.recent_statuses(&e, 1).await.expect("query");
        assert_eq!(recent[0].status, 429);
    }
}
