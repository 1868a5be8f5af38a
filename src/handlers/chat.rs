//! Chat completions proxy handler
//!
//! Accepts a chat-completion request, dispatches it across the configured
//! endpoint pool, and forwards the winning upstream body verbatim.

use crate::dispatch::RelayRequest;
use crate::endpoint::EndpointId;
use crate::error::{RelayError, RelayResult};
use crate::handlers::AppState;
use crate::message::ChatMessage;
use crate::middleware::RequestId;
use axum::{
    Extension, Json,
    extract::State,
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;

/// Chat completions request from the caller
///
/// `model` names either a full `provider/model[/region]` endpoint or a bare
/// model name resolved against the configured pool. Provider-specific fields
/// beyond `messages` are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

impl ChatCompletionRequest {
    /// Validate the request shape
    pub fn validate(&self) -> RelayResult<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "model cannot be empty".to_string(),
            ));
        }
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest(
                "messages cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the endpoint the caller targeted
    ///
    /// A qualified `provider/model` name must parse; a bare model name is
    /// matched against the configured pool and yields no target when absent
    /// (the planner then keeps its own order).
    pub fn requested_endpoint(&self, state: &AppState) -> RelayResult<Option<EndpointId>> {
        let name = self.model.trim();
        if name.contains('/') {
            let endpoint = EndpointId::parse(name)
                .map_err(|e| RelayError::InvalidRequest(format!("invalid model: {}", e)))?;
            return Ok(Some(endpoint));
        }

        Ok(state
            .config()
            .models()
            .endpoints()
            .into_iter()
            .find(|e| e.model() == name))
    }
}

/// POST /v1/chat/completions handler
///
/// The response body comes back verbatim from whichever upstream attempt
/// succeeded; dispatch errors map to statuses via `RelayError`.
pub async fn handler(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, RelayError> {
    request.validate()?;
    let requested = request.requested_endpoint(&state)?;

    tracing::debug!(
        request_id = %request_id,
        model = %request.model,
        requested = requested.as_ref().map(|e| e.to_string()),
        messages_count = request.messages.len(),
        "Received chat completions request"
    );

    // No cooperative cancel signal over HTTP: a client disconnect drops this
    // handler future, and the executor's guard records the abandoned attempt.
    let relay_request = RelayRequest {
        requested,
        messages: request.messages.clone(),
        original: None,
        cancel: None,
    };

    let upstream = state.dispatcher().dispatch(relay_request, request_id).await?;

    let mut response = Response::builder().status(
        StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK),
    );
    if let Some(content_type) = &upstream.content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .map_err(|e| RelayError::Internal(format!("response assembly failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use std::str::FromStr;
    use std::sync::Arc;

    fn test_state() -> AppState {
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
        AppState::new(config, Arc::new(MemoryStore::new(100))).expect("state")
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
        }
    }

    #[test]
    fn test_request_deserializes_with_extra_fields_ignored() {
        let json = r#"{
            "model": "openai/gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "max_tokens": 128
        }"#;
        let parsed: ChatCompletionRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.model, "openai/gpt-4");
        assert_eq!(parsed.messages.len(), 1);
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        let result = request("  ").validate();
        assert!(matches!(result, Err(RelayError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_rejects_empty_messages() {
        let req = ChatCompletionRequest {
            model: "openai/gpt-4".to_string(),
            messages: vec![],
        };
        assert!(matches!(
            req.validate(),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_qualified_model_resolves_to_endpoint() {
        let state = test_state();
        let requested = request("azure/gpt-4")
            .requested_endpoint(&state)
            .expect("resolve");
        assert_eq!(
            requested,
            Some(EndpointId::parse("azure/gpt-4").expect("parse"))
        );
    }

    #[test]
    fn test_bare_model_resolves_against_pool() {
        let state = test_state();
        let requested = request("gpt-4").requested_endpoint(&state).expect("resolve");
        // Both configured endpoints carry the model name; the first in
        // declaration order wins.
        assert_eq!(
            requested,
            Some(EndpointId::parse("openai/gpt-4").expect("parse"))
        );
    }

    #[test]
    fn test_unknown_bare_model_resolves_to_none() {
        let state = test_state();
        let requested = request("mystery-model")
            .requested_endpoint(&state)
            .expect("resolve");
        assert_eq!(requested, None);
    }

    #[test]
    fn test_unknown_provider_is_invalid_request() {
        let state = test_state();
        let result = request("acme/gpt-4").requested_endpoint(&state);
        assert!(matches!(result, Err(RelayError::InvalidRequest(_))));
    }
}
