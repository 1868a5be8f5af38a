//! The dispatch loop: walk candidates until success or exhaustion
//!
//! One incoming request traverses this loop exactly once. Each candidate is
//! admission-checked before any attempt; admissible candidates are retried
//! within status-aware budgets with constant backoff between attempts. An
//! HTTP error that flips the endpoint unhealthy aborts the whole dispatch.

use crate::config::Config;
use crate::endpoint::EndpointId;
use crate::error::{RelayError, RelayResult};
use crate::executor::{
    AttemptExecutor, AttemptOutcome, CancelSignal, OriginalCall, UpstreamResponse, wait_cancelled,
};
use crate::health::{HealthOracle, Verdict};
use crate::message::ChatMessage;
use crate::metrics::Metrics;
use crate::middleware::RequestId;
use crate::planner::CandidatePlanner;
use crate::store::SampleStore;
use std::sync::Arc;

/// One caller request, parsed and ready to dispatch
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Endpoint the caller targeted, if it could be derived from the request
    pub requested: Option<EndpointId>,
    /// The caller's conversation
    pub messages: Vec<ChatMessage>,
    /// The caller's original outbound request, for verbatim first-attempt reuse
    pub original: Option<OriginalCall>,
    /// Caller cancellation; a flip to true aborts the dispatch immediately
    pub cancel: Option<CancelSignal>,
}

/// Drives planning, admission, attempts, and failover for each request
pub struct Dispatcher {
    config: Arc<Config>,
    planner: CandidatePlanner,
    oracle: HealthOracle,
    executor: AttemptExecutor,
    metrics: Metrics,
}

impl Dispatcher {
    /// Build a dispatcher over a shared sample store
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SampleStore>,
        metrics: Metrics,
    ) -> RelayResult<Self> {
        let planner = CandidatePlanner::new(config.clone());
        let oracle = HealthOracle::new(config.clone(), store.clone());
        let executor = AttemptExecutor::new(config.clone(), store, metrics.clone())?;
        Ok(Self {
            config,
            planner,
            oracle,
            executor,
            metrics,
        })
    }

    /// The health oracle, for serving-side admissibility views
    pub fn oracle(&self) -> &HealthOracle {
        &self.oracle
    }

    /// Dispatch one request across the candidate pool
    ///
    /// Returns the first successful upstream response, or the classified
    /// error that ended the dispatch.
    pub async fn dispatch(
        &self,
        request: RelayRequest,
        request_id: RequestId,
    ) -> RelayResult<UpstreamResponse> {
        let candidates = self.planner.plan(request.requested.as_ref());
        let total = candidates.len();
        let mut last_err: Option<RelayError> = None;

        for (position, endpoint) in candidates.into_iter().enumerate() {
            match self.oracle.admissible(&endpoint).await {
                Verdict::Unhealthy(reason) => {
                    tracing::info!(
                        request_id = %request_id,
                        endpoint = %endpoint,
                        reason = %reason,
                        "Skipping inadmissible candidate"
                    );
                    self.metrics.record_inadmissible(&endpoint.to_string());
                    last_err = Some(RelayError::EndpointInadmissible {
                        endpoint: endpoint.to_string(),
                        reason: reason.to_string(),
                    });
                    continue;
                }
                Verdict::Healthy => {}
            }

            let mut attempt: u32 = 0;
            let mut last_status: u16 = 0;

            loop {
                let budget = self.config.retry_budget(&endpoint, last_status);
                if attempt >= budget {
                    tracing::debug!(
                        request_id = %request_id,
                        endpoint = %endpoint,
                        attempts = attempt,
                        budget = budget,
                        "Attempt budget exhausted"
                    );
                    break;
                }

                // A Cancelled error propagates straight out of the dispatch;
                // no later candidate is attempted.
                let outcome = self
                    .executor
                    .attempt(
                        &endpoint,
                        &request.messages,
                        request.original.as_ref(),
                        attempt,
                        request.cancel.clone(),
                    )
                    .await?;

                match outcome {
                    AttemptOutcome::Success(response) => {
                        return Ok(response);
                    }
                    AttemptOutcome::HttpError { status, error } => {
                        last_status = status;
                        last_err = Some(error);

                        // A response that flips the endpoint unhealthy ends
                        // the whole dispatch, not just this endpoint.
                        if let Verdict::Unhealthy(reason) = self.oracle.admissible(&endpoint).await
                        {
                            tracing::warn!(
                                request_id = %request_id,
                                endpoint = %endpoint,
                                status = status,
                                reason = %reason,
                                "Endpoint became unhealthy after error response, aborting dispatch"
                            );
                            return Err(RelayError::EndpointBecameUnhealthy {
                                endpoint: endpoint.to_string(),
                                status,
                                reason: reason.to_string(),
                            });
                        }
                    }
                    AttemptOutcome::TransportFailure(error) => {
                        last_err = Some(error);
                    }
                }

                attempt += 1;
                let budget = self.config.retry_budget(&endpoint, last_status);
                if attempt < budget {
                    let backoff = self.config.backoff(&endpoint);
                    if !backoff.is_zero() {
                        let mut cancel = request.cancel.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = wait_cancelled(&mut cancel) => {
                                tracing::info!(
                                    request_id = %request_id,
                                    endpoint = %endpoint,
                                    "Dispatch cancelled during backoff"
                                );
                                return Err(RelayError::Cancelled);
                            }
                        }
                    }
                }
            }

            if position + 1 < total {
                self.metrics.record_failover();
                tracing::info!(
                    request_id = %request_id,
                    endpoint = %endpoint,
                    "Advancing to next candidate"
                );
            }
        }

        let last = last_err.unwrap_or_else(|| {
            RelayError::Internal("dispatch ended with no candidates attempted".to_string())
        });
        tracing::warn!(
            request_id = %request_id,
            candidates = total,
            error = %last,
            "All candidates exhausted"
        );
        Err(RelayError::AllFailed(Box::new(last)))
    }
}
