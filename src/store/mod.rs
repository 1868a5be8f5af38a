//! Sample store: append-only, time-indexed latency and status samples
//!
//! One logical log per endpoint, shared by every in-flight dispatch. The
//! health oracle only depends on the contract here, so deployments can pick
//! the in-memory backend (single process) or the Redis backend (health state
//! shared across processes).

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::endpoint::EndpointId;
use crate::error::RelayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Milliseconds since the Unix epoch, UTC
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Outcome tag carried by latency samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyOutcome {
    Success,
    Failed,
}

/// One recorded round-trip duration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub timestamp_ms: i64,
    pub seconds: f64,
    pub outcome: LatencyOutcome,
}

impl LatencySample {
    /// A sample stamped with the current time
    pub fn now(seconds: f64, outcome: LatencyOutcome) -> Self {
        Self {
            timestamp_ms: now_ms(),
            seconds,
            outcome,
        }
    }
}

/// One recorded HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSample {
    pub timestamp_ms: i64,
    pub status: u16,
}

impl StatusSample {
    /// A sample stamped with the current time
    pub fn now(status: u16) -> Self {
        Self {
            timestamp_ms: now_ms(),
            status,
        }
    }
}

/// Contract every sample store backend satisfies
///
/// Writes are atomic with respect to concurrent readers of the same endpoint;
/// cross-endpoint isolation is not required. `recent_*` queries return
/// newest-first and reflect all writes that completed before the call on the
/// same logical client.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Append one latency sample for an endpoint
    async fn append_latency(&self, endpoint: &EndpointId, sample: LatencySample)
    -> RelayResult<()>;

    /// Append one status sample for an endpoint
    async fn append_status(&self, endpoint: &EndpointId, sample: StatusSample) -> RelayResult<()>;

    /// Most recent latency samples, newest-first, at most `n`
    async fn recent_latencies(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<LatencySample>>;

    /// Most recent status samples, newest-first, at most `n`
    async fn recent_statuses(
        &self,
        endpoint: &EndpointId,
        n: usize,
    ) -> RelayResult<Vec<StatusSample>>;

    /// Remove all samples strictly older than `now - horizon`
    ///
    /// Returns the number of samples removed.
    async fn evict_older_than(&self, endpoint: &EndpointId, horizon: Duration)
    -> RelayResult<usize>;

    /// Every endpoint with at least one stored sample
    async fn endpoints(&self) -> RelayResult<Vec<EndpointId>>;
}

/// Handle to the periodic eviction task
///
/// The task walks every endpoint in the store at `cleanup_interval` and
/// evicts samples older than the retention horizon. Locking granularity is
/// per-endpoint inside the backends, so dispatch flows are never starved.
pub struct EvictionTask {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl EvictionTask {
    /// Spawn the background eviction loop
    pub fn spawn(store: Arc<dyn SampleStore>, max_age: Duration, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;

            tracing::info!(
                interval_seconds = interval.as_secs_f64(),
                max_age_seconds = max_age.as_secs_f64(),
                "Started periodic sample eviction task"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_eviction_pass(store.as_ref(), max_age).await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Eviction task shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// One sweep over every endpoint in the store
async fn run_eviction_pass(store: &dyn SampleStore, max_age: Duration) {
    let endpoints = match store.endpoints().await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            tracing::warn!(error = %e, "Eviction pass could not enumerate endpoints");
            return;
        }
    };

    for endpoint in endpoints {
        match store.evict_older_than(&endpoint, max_age).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(
                    endpoint = %endpoint,
                    removed = removed,
                    "Evicted expired samples"
                );
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %e,
                    "Eviction failed for endpoint"
                );
            }
        }
    }
}
