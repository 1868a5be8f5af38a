//! Prometheus metrics endpoint
//!
//! Exposes metrics in Prometheus text format for scraping.

use axum::{extract::State, http::StatusCode};

use crate::handlers::AppState;

/// GET /metrics handler for Prometheus scraping
///
/// Returns `200 OK` with metrics in Prometheus text format, or `500` if
/// encoding fails.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics().gather() {
        Ok(output) => (StatusCode::OK, output),
        Err(e) => {
            tracing::error!(error = %e, "Failed to gather metrics for scraping");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics collection failed: {}", e),
            )
        }
    }
}
