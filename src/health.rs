//! Endpoint health oracle
//!
//! Answers one question: is this endpoint admissible right now? Verdicts are
//! derived from recent samples against the configured latency and error-rate
//! thresholds. Once an endpoint trips a threshold it stays unhealthy for the
//! full recovery duration, measured from the newest sample of the tripping
//! window, no matter what samples arrive in the meantime.

use crate::config::Config;
use crate::endpoint::EndpointId;
use crate::store::{LatencyOutcome, SampleStore, now_ms};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why an endpoint was ruled inadmissible
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnhealthyReason {
    /// Rolling latency mean exceeded the threshold
    Latency {
        mean_seconds: f64,
        threshold_seconds: f64,
    },
    /// A tracked status code exceeded its failure-rate threshold
    ErrorRate {
        status: u16,
        percent: f64,
        threshold_percent: f64,
    },
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::Latency {
                mean_seconds,
                threshold_seconds,
            } => write!(
                f,
                "rolling latency mean {:.3}s exceeds threshold {:.3}s",
                mean_seconds, threshold_seconds
            ),
            UnhealthyReason::ErrorRate {
                status,
                percent,
                threshold_percent,
            } => write!(
                f,
                "status {} rate {:.1}% exceeds threshold {:.1}%",
                status, percent, threshold_percent
            ),
        }
    }
}

/// Admissibility verdict for one endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Healthy,
    Unhealthy(UnhealthyReason),
}

impl Verdict {
    /// Whether the endpoint may be tried right now
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Healthy)
    }
}

/// Hysteresis hold for an endpoint that tripped a threshold
#[derive(Debug, Clone, Copy)]
struct Hold {
    until_ms: i64,
    reason: UnhealthyReason,
}

/// Derives endpoint admissibility from the sample store
///
/// Store failures never fail a dispatch: they are logged and treated as
/// insufficient evidence, which reads as healthy.
pub struct HealthOracle {
    config: Arc<Config>,
    store: Arc<dyn SampleStore>,
    holds: RwLock<HashMap<EndpointId, Hold>>,
}

impl HealthOracle {
    /// Create an oracle over the given store
    pub fn new(config: Arc<Config>, store: Arc<dyn SampleStore>) -> Self {
        Self {
            config,
            store,
            holds: RwLock::new(HashMap::new()),
        }
    }

    /// Current admissibility verdict for an endpoint
    ///
    /// The latency rule is evaluated before the error-rate rules; the first
    /// unhealthy result wins.
    pub async fn admissible(&self, endpoint: &EndpointId) -> Verdict {
        let now = now_ms();

        if let Some(reason) = self.check_hold(endpoint, now).await {
            return Verdict::Unhealthy(reason);
        }

        if let Some(reason) = self.latency_verdict(endpoint, now).await {
            return Verdict::Unhealthy(reason);
        }

        if let Some(reason) = self.error_rate_verdict(endpoint, now).await {
            return Verdict::Unhealthy(reason);
        }

        Verdict::Healthy
    }

    /// Consult the hysteresis hold, releasing it when recovery has elapsed
    ///
    /// Releasing a hold is the exit from the unhealthy state: the endpoint's
    /// expired samples are evicted so the next verdict starts from fresh
    /// evidence.
    async fn check_hold(&self, endpoint: &EndpointId, now: i64) -> Option<UnhealthyReason> {
        let held = {
            let holds = self.holds.read().await;
            holds.get(endpoint).copied()
        };
        let hold = held?;

        if now < hold.until_ms {
            return Some(hold.reason);
        }

        let mut holds = self.holds.write().await;
        if holds.remove(endpoint).is_some() {
            drop(holds);
            tracing::info!(
                endpoint = %endpoint,
                "Recovery elapsed, endpoint leaves unhealthy state"
            );
            if let Err(e) = self
                .store
                .evict_older_than(endpoint, self.config.retention().max_age())
                .await
            {
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %e,
                    "Post-recovery sample eviction failed"
                );
            }
        }
        None
    }

    /// Record a trip so the endpoint stays unhealthy until `t_last + recovery`
    async fn hold(&self, endpoint: &EndpointId, until_ms: i64, reason: UnhealthyReason) {
        let mut holds = self.holds.write().await;
        holds.insert(
            endpoint.clone(),
            Hold {
                until_ms,
                reason,
            },
        );
    }

    /// Latency-health rule over the most recent window of success samples
    async fn latency_verdict(&self, endpoint: &EndpointId, now: i64) -> Option<UnhealthyReason> {
        let tracking = self.config.latency_tracking(endpoint)?;
        let window = tracking.window_size();

        let samples = match self.store.recent_latencies(endpoint, window).await {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %e,
                    "Latency query failed, treating as insufficient evidence"
                );
                return None;
            }
        };

        let successes: Vec<_> = samples
            .into_iter()
            .filter(|s| s.outcome == LatencyOutcome::Success)
            .collect();
        if successes.len() < window {
            return None;
        }

        let mean = successes.iter().map(|s| s.seconds).sum::<f64>() / successes.len() as f64;
        if mean <= tracking.threshold_seconds() {
            return None;
        }

        // Newest-first ordering puts t_last at the front.
        let t_last = successes.first().map(|s| s.timestamp_ms).unwrap_or(now);
        let recovery_ms = tracking.recovery(self.config.limits()).as_millis() as i64;
        if now - t_last >= recovery_ms {
            return None;
        }

        let reason = UnhealthyReason::Latency {
            mean_seconds: mean,
            threshold_seconds: tracking.threshold_seconds(),
        };
        self.hold(endpoint, t_last + recovery_ms, reason).await;
        tracing::warn!(
            endpoint = %endpoint,
            mean_seconds = mean,
            threshold_seconds = tracking.threshold_seconds(),
            window = window,
            "Endpoint ruled unhealthy by latency"
        );
        Some(reason)
    }

    /// Error-rate rule for each tracked status code, ascending status order
    async fn error_rate_verdict(&self, endpoint: &EndpointId, now: i64) -> Option<UnhealthyReason> {
        for (status, tracking) in self.config.error_tracking(endpoint) {
            let window = tracking.window_size();
            let samples = match self.store.recent_statuses(endpoint, window).await {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Status query failed, treating as insufficient evidence"
                    );
                    continue;
                }
            };
            if samples.len() < window {
                continue;
            }

            let matching = samples.iter().filter(|s| s.status == status).count();
            let percent = matching as f64 / window as f64 * 100.0;
            if percent < tracking.error_percent_threshold() {
                continue;
            }

            let t_last = samples.first().map(|s| s.timestamp_ms).unwrap_or(now);
            let recovery_ms = tracking.recovery(self.config.limits()).as_millis() as i64;
            if now - t_last >= recovery_ms {
                continue;
            }

            let reason = UnhealthyReason::ErrorRate {
                status,
                percent,
                threshold_percent: tracking.error_percent_threshold(),
            };
            self.hold(endpoint, t_last + recovery_ms, reason).await;
            tracing::warn!(
                endpoint = %endpoint,
                status = status,
                percent = percent,
                threshold_percent = tracking.error_percent_threshold(),
                "Endpoint ruled unhealthy by error rate"
            );
            return Some(reason);
        }
        None
    }
}
