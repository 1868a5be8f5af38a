//! Prometheus metrics collection for modelrelay
//!
//! Tracks per-endpoint attempt outcomes and latency, pre-flight denials, and
//! candidate fallovers. Exposed via the `/metrics` endpoint in Prometheus
//! text format.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Attempt outcome label values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    HttpError,
    Transport,
    Cancelled,
}

impl AttemptResult {
    /// Convert outcome to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Success => "success",
            AttemptResult::HttpError => "http_error",
            AttemptResult::Transport => "transport",
            AttemptResult::Cancelled => "cancelled",
        }
    }
}

/// Metrics collector for modelrelay
///
/// Endpoint label cardinality is bounded by the configured model pool.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    attempts_total: CounterVec,
    attempt_latency: HistogramVec,
    inadmissible_total: CounterVec,
    failovers_total: IntCounter,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let attempts_total = CounterVec::new(
            Opts::new(
                "modelrelay_attempts_total",
                "Upstream attempts by endpoint and outcome",
            ),
            &["endpoint", "outcome"],
        )?;

        let attempt_latency = HistogramVec::new(
            HistogramOpts::new(
                "modelrelay_attempt_latency_seconds",
                "Upstream attempt wall time in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["endpoint"],
        )?;

        let inadmissible_total = CounterVec::new(
            Opts::new(
                "modelrelay_inadmissible_total",
                "Pre-flight admissibility denials by endpoint",
            ),
            &["endpoint"],
        )?;

        let failovers_total = IntCounter::new(
            "modelrelay_failovers_total",
            "Dispatches that advanced past their first candidate",
        )?;

        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(attempt_latency.clone()))?;
        registry.register(Box::new(inadmissible_total.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            attempts_total,
            attempt_latency,
            inadmissible_total,
            failovers_total,
        })
    }

    /// Record one upstream attempt
    pub fn record_attempt(&self, endpoint: &str, outcome: AttemptResult, seconds: f64) {
        self.attempts_total
            .with_label_values(&[endpoint, outcome.as_str()])
            .inc();
        self.attempt_latency
            .with_label_values(&[endpoint])
            .observe(seconds);
    }

    /// Record a pre-flight denial
    pub fn record_inadmissible(&self, endpoint: &str) {
        self.inadmissible_total.with_label_values(&[endpoint]).inc();
    }

    /// Record an advance to the next candidate
    pub fn record_failover(&self) {
        self.failovers_total.inc();
    }

    /// Render all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("metrics text was not valid UTF-8: {}", e))
        })
    }
}
