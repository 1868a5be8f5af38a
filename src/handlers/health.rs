//! Health endpoint
//!
//! Reports the oracle's current admissibility verdict for every configured
//! endpoint, for monitoring and load balancers.

use crate::handlers::AppState;
use crate::health::Verdict;
use axum::{Json, extract::State};
use futures::future::join_all;
use serde::Serialize;

/// Admissibility view of one endpoint
#[derive(Debug, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub admissible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Health response body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub endpoints: Vec<EndpointStatus>,
}

/// GET /health handler
///
/// The service itself is always `ok` while serving; individual endpoints
/// carry their own verdicts.
pub async fn handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let oracle = state.dispatcher().oracle();
    let endpoints = join_all(state.config().models().endpoints().into_iter().map(
        |endpoint| async move {
            match oracle.admissible(&endpoint).await {
                Verdict::Healthy => EndpointStatus {
                    endpoint: endpoint.to_string(),
                    admissible: true,
                    reason: None,
                },
                Verdict::Unhealthy(reason) => EndpointStatus {
                    endpoint: endpoint.to_string(),
                    admissible: false,
                    reason: Some(reason.to_string()),
                },
            }
        },
    ))
    .await;

    Json(HealthResponse {
        status: "ok",
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use std::str::FromStr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_lists_all_configured_endpoints() {
        let toml = r#"
models = ["openai/gpt-4", "azure/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-test"

[[clients]]
url = "https://res.azure.openai.com/base"
[clients.headers]
api-key = "k"
"#;
        let config = Arc::new(Config::from_str(toml).expect("should parse config"));
        let state = AppState::new(config, Arc::new(MemoryStore::new(100))).expect("state");

        let Json(body) = handler(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.endpoints.len(), 2);
        assert!(body.endpoints.iter().all(|e| e.admissible));
        assert!(body.endpoints.iter().all(|e| e.reason.is_none()));
    }
}
