//! HTTP request handlers for the modelrelay API

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{RelayError, RelayResult};
use crate::metrics::Metrics;
use crate::store::SampleStore;
use std::sync::Arc;

pub mod chat;
pub mod health;
pub mod metrics;

/// Application state shared across all handlers
///
/// All fields are Arc'd for cheap cloning across Axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    metrics: Metrics,
}

impl AppState {
    /// Create application state over a shared sample store
    pub fn new(config: Arc<Config>, store: Arc<dyn SampleStore>) -> RelayResult<Self> {
        let metrics = Metrics::new()
            .map_err(|e| RelayError::Internal(format!("metrics registration failed: {}", e)))?;
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), store, metrics.clone())?);

        Ok(Self {
            config,
            dispatcher,
            metrics,
        })
    }

    /// Get reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get reference to the dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Get reference to the metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
