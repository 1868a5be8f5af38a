//! Attempt execution: one HTTP round-trip against one endpoint
//!
//! The executor rewrites the request for the target provider, applies the
//! per-attempt deadline, performs the round-trip, classifies the outcome,
//! and records exactly one latency sample per attempt plus one status sample
//! per HTTP response received.

use crate::config::Config;
use crate::endpoint::{EndpointId, Provider};
use crate::error::{RelayError, RelayResult};
use crate::message::{ChatMessage, Role, combine};
use crate::metrics::{AttemptResult, Metrics};
use crate::store::{LatencyOutcome, LatencySample, SampleStore, StatusSample};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Azure OpenAI API version pinned by the rewrite rules
const AZURE_API_VERSION: &str = "2023-05-15";

/// Cooperative cancellation signal for one caller request
///
/// The sender flips the value to true to cancel; every attempt races the
/// round-trip against it.
pub type CancelSignal = tokio::sync::watch::Receiver<bool>;

/// Resolve once the signal reads cancelled; never resolves otherwise
///
/// A missing signal, or one whose sender is gone, can never fire.
pub(crate) async fn wait_cancelled(signal: &mut Option<CancelSignal>) {
    let Some(rx) = signal else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// The request as the caller originally addressed it
///
/// When the attempted endpoint matches the caller's target, the original URL
/// and headers are reused verbatim instead of synthesizing from a template.
#[derive(Debug, Clone)]
pub struct OriginalCall {
    pub endpoint: EndpointId,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// A fully rewritten outgoing request, ready to send
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: reqwest::Url,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Response forwarded verbatim from a successful upstream attempt
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Classified result of one attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Status in [200, 300)
    Success(UpstreamResponse),
    /// Any other HTTP status
    HttpError { status: u16, error: RelayError },
    /// Connection, DNS, timeout, or read failure
    TransportFailure(RelayError),
}

/// Executes single attempts and records their samples
pub struct AttemptExecutor {
    http: reqwest::Client,
    config: Arc<Config>,
    store: Arc<dyn SampleStore>,
    metrics: Metrics,
}

impl AttemptExecutor {
    /// Create an executor sharing one HTTP client across all attempts
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SampleStore>,
        metrics: Metrics,
    ) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            store,
            metrics,
        })
    }

    /// Perform one attempt against `endpoint`
    ///
    /// The round-trip races the caller's cancellation signal; cancellation
    /// aborts the attempt, records its failure-tagged sample, and surfaces
    /// `Cancelled`. Returns other `Err`s only for failures that preclude any
    /// HTTP call (invalid message sequence, missing template); transport and
    /// HTTP failures are classified outcomes.
    pub async fn attempt(
        &self,
        endpoint: &EndpointId,
        messages: &[ChatMessage],
        original: Option<&OriginalCall>,
        attempt: u32,
        cancel: Option<CancelSignal>,
    ) -> RelayResult<AttemptOutcome> {
        let prepared = self.prepare(endpoint, messages, original)?;

        tracing::debug!(
            endpoint = %endpoint,
            url = %prepared.url,
            attempt = attempt,
            "Dispatching attempt"
        );

        let deadline = self.config.timeout(endpoint);
        let started = Instant::now();

        let round_trip = async {
            let mut request = self.http.post(prepared.url.clone());
            for (name, value) in &prepared.headers {
                request = request.header(name, value);
            }
            let response = request.json(&prepared.body).send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(UpstreamResponse {
                status,
                content_type,
                body: body.to_vec(),
            })
        };

        // If the caller abandons this future mid-flight, the guard still
        // records the failure-tagged sample for the attempt underway.
        let mut guard = AttemptGuard::new(
            self.store.clone(),
            self.metrics.clone(),
            endpoint.clone(),
            started,
        );
        let mut cancel = cancel;

        let result = tokio::select! {
            result = tokio::time::timeout(deadline, round_trip) => result,
            _ = wait_cancelled(&mut cancel) => {
                let elapsed = started.elapsed().as_secs_f64();
                guard.disarm();
                self.record_latency(endpoint, elapsed, LatencyOutcome::Failed)
                    .await;
                self.metrics
                    .record_attempt(&endpoint.to_string(), AttemptResult::Cancelled, elapsed);
                tracing::info!(
                    endpoint = %endpoint,
                    elapsed_seconds = elapsed,
                    attempt = attempt,
                    "Attempt cancelled by the caller"
                );
                return Err(RelayError::Cancelled);
            }
        };
        let elapsed = started.elapsed().as_secs_f64();
        guard.disarm();

        match result {
            Err(_) => {
                self.record_latency(endpoint, elapsed, LatencyOutcome::Failed)
                    .await;
                self.metrics
                    .record_attempt(&endpoint.to_string(), AttemptResult::Transport, elapsed);
                Ok(AttemptOutcome::TransportFailure(RelayError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: format!(
                        "attempt deadline of {:.1}s exceeded",
                        deadline.as_secs_f64()
                    ),
                }))
            }
            Ok(Err(e)) => {
                self.record_latency(endpoint, elapsed, LatencyOutcome::Failed)
                    .await;
                self.metrics
                    .record_attempt(&endpoint.to_string(), AttemptResult::Transport, elapsed);
                Ok(AttemptOutcome::TransportFailure(RelayError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                }))
            }
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                self.record_latency(endpoint, elapsed, LatencyOutcome::Success)
                    .await;
                self.record_status(endpoint, response.status).await;
                self.metrics
                    .record_attempt(&endpoint.to_string(), AttemptResult::Success, elapsed);
                tracing::info!(
                    endpoint = %endpoint,
                    status = response.status,
                    elapsed_seconds = elapsed,
                    attempt = attempt,
                    "Attempt succeeded"
                );
                Ok(AttemptOutcome::Success(response))
            }
            Ok(Ok(response)) => {
                self.record_latency(endpoint, elapsed, LatencyOutcome::Failed)
                    .await;
                self.record_status(endpoint, response.status).await;
                self.metrics
                    .record_attempt(&endpoint.to_string(), AttemptResult::HttpError, elapsed);
                let message = extract_error_message(&response.body);
                tracing::warn!(
                    endpoint = %endpoint,
                    status = response.status,
                    elapsed_seconds = elapsed,
                    attempt = attempt,
                    upstream_message = %message,
                    "Attempt returned error status"
                );
                Ok(AttemptOutcome::HttpError {
                    status: response.status,
                    error: RelayError::Http {
                        endpoint: endpoint.to_string(),
                        status: response.status,
                        message,
                    },
                })
            }
        }
    }

    /// Build the outgoing request for one attempt
    ///
    /// Combines the endpoint's prefix messages with the caller's, then either
    /// reuses the caller's URL and headers (same endpoint) or clones the
    /// provider template and applies the provider-specific rewrites.
    pub fn prepare(
        &self,
        endpoint: &EndpointId,
        messages: &[ChatMessage],
        original: Option<&OriginalCall>,
    ) -> RelayResult<PreparedRequest> {
        let combined = combine(self.config.prefix_messages(endpoint), messages)?;

        if let Some(original) = original {
            if original.endpoint == *endpoint {
                let url = reqwest::Url::parse(&original.url).map_err(|e| {
                    RelayError::InvalidRequest(format!(
                        "original URL '{}' does not parse: {}",
                        original.url, e
                    ))
                })?;
                let headers = original
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                return Ok(PreparedRequest {
                    url,
                    headers,
                    body: body_for(endpoint, &combined),
                });
            }
        }

        let template = self.config.template_for(endpoint.provider()).ok_or_else(|| {
            RelayError::Internal(format!(
                "no client template for provider '{}'",
                endpoint.provider()
            ))
        })?;
        let key = template.api_key().ok_or_else(|| {
            RelayError::Internal(format!(
                "client template '{}' carries no credential",
                template.url()
            ))
        })?;

        let mut url = reqwest::Url::parse(template.url()).map_err(|e| {
            RelayError::Internal(format!(
                "template URL '{}' does not parse: {}",
                template.url(),
                e
            ))
        })?;

        let mut headers: Vec<(String, String)> = Vec::new();
        match endpoint.provider() {
            Provider::OpenAi => {
                // URL stays as the template has it; bearer auth replaces any
                // api-key header.
                for (name, value) in template.headers() {
                    if name.eq_ignore_ascii_case("api-key")
                        || name.eq_ignore_ascii_case("authorization")
                    {
                        continue;
                    }
                    headers.push((name.clone(), value.clone()));
                }
                headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
            }
            Provider::Azure => {
                url.set_path(&format!(
                    "/openai/deployments/{}/chat/completions",
                    endpoint.model()
                ));
                url.set_query(Some(&format!("api-version={}", AZURE_API_VERSION)));
                for (name, value) in template.headers() {
                    if name.eq_ignore_ascii_case("api-key")
                        || name.eq_ignore_ascii_case("authorization")
                    {
                        continue;
                    }
                    headers.push((name.clone(), value.clone()));
                }
                headers.push(("api-key".to_string(), key));
            }
            Provider::Vertex => {
                // URL and headers follow the template; credentials are
                // whatever the template injected (typically an OAuth2 bearer).
                for (name, value) in template.headers() {
                    headers.push((name.clone(), value.clone()));
                }
            }
        }

        Ok(PreparedRequest {
            url,
            headers,
            body: body_for(endpoint, &combined),
        })
    }

    async fn record_latency(&self, endpoint: &EndpointId, seconds: f64, outcome: LatencyOutcome) {
        if let Err(e) = self
            .store
            .append_latency(endpoint, LatencySample::now(seconds, outcome))
            .await
        {
            tracing::warn!(
                endpoint = %endpoint,
                error = %e,
                "Latency sample dropped (request continues)"
            );
        }
    }

    async fn record_status(&self, endpoint: &EndpointId, status: u16) {
        if let Err(e) = self
            .store
            .append_status(endpoint, StatusSample::now(status))
            .await
        {
            tracing::warn!(
                endpoint = %endpoint,
                error = %e,
                "Status sample dropped (request continues)"
            );
        }
    }
}

/// Records the failure-tagged sample for an attempt whose future is dropped
///
/// Disarmed on every path that records its own sample. Recording from drop
/// has to go through a spawned task since the store is async; when no
/// runtime is available (process teardown) the sample is lost, which is
/// acceptable for a process that is exiting.
struct AttemptGuard {
    store: Arc<dyn SampleStore>,
    metrics: Metrics,
    endpoint: EndpointId,
    started: Instant,
    armed: bool,
}

impl AttemptGuard {
    fn new(
        store: Arc<dyn SampleStore>,
        metrics: Metrics,
        endpoint: EndpointId,
        started: Instant,
    ) -> Self {
        Self {
            store,
            metrics,
            endpoint,
            started,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        self.metrics
            .record_attempt(&self.endpoint.to_string(), AttemptResult::Cancelled, elapsed);
        tracing::info!(
            endpoint = %self.endpoint,
            elapsed_seconds = elapsed,
            "Attempt abandoned mid-flight, recording failure sample"
        );

        let store = self.store.clone();
        let endpoint = self.endpoint.clone();
        let sample = LatencySample::now(elapsed, LatencyOutcome::Failed);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.append_latency(&endpoint, sample).await {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Failure sample for abandoned attempt was dropped"
                    );
                }
            });
        }
    }
}

/// Provider-specific request body for the combined message list
fn body_for(endpoint: &EndpointId, messages: &[ChatMessage]) -> serde_json::Value {
    match endpoint.provider() {
        Provider::OpenAi => serde_json::json!({
            "model": endpoint.model(),
            "messages": messages,
        }),
        // Azure names the deployment in the URL path, never in the body.
        Provider::Azure => serde_json::json!({
            "messages": messages,
        }),
        Provider::Vertex => vertex_body(messages),
    }
}

/// Vertex (Gemini) native chat shape
///
/// System content becomes `systemInstruction`; assistant turns map to the
/// `model` role.
fn vertex_body(messages: &[ChatMessage]) -> serde_json::Value {
    let mut body = serde_json::json!({
        "contents": messages
            .iter()
            .filter(|m| m.role() != Role::System)
            .map(|m| {
                serde_json::json!({
                    "role": match m.role() {
                        Role::Assistant => "model",
                        _ => "user",
                    },
                    "parts": [{"text": m.content()}],
                })
            })
            .collect::<Vec<_>>(),
    });

    if let Some(system) = messages.iter().find(|m| m.role() == Role::System) {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{"text": system.content()}],
        });
    }
    body
}

/// Best-effort extraction of `{"error": {"message": ...}}` from a body
fn extract_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::str::FromStr;

    fn endpoint(s: &str) -> EndpointId {
        EndpointId::parse(s).expect("should parse endpoint")
    }

    fn executor(toml: &str) -> AttemptExecutor {
        let config = Arc::new(Config::from_str(toml).expect("should parse config"));
        AttemptExecutor::new(
            config,
            Arc::new(MemoryStore::new(100)),
            Metrics::new().expect("metrics"),
        )
        .expect("executor")
    }

    fn two_provider_executor() -> AttemptExecutor {
        executor(
            r#"
models = ["openai/gpt-4", "azure/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-live"

[[clients]]
url = "https://res.azure.openai.com/openai/deployments/gpt-35/chat/completions"
[clients.headers]
api-key = "azure-key"
"#,
        )
    }

    fn header<'a>(prepared: &'a PreparedRequest, name: &str) -> Option<&'a str> {
        prepared
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_openai_request_shape() {
        let executor = two_provider_executor();
        let prepared = executor
            .prepare(&endpoint("openai/gpt-4"), &[ChatMessage::user("hi")], None)
            .expect("prepare");

        assert_eq!(
            prepared.url.as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(header(&prepared, "authorization"), Some("Bearer sk-live"));
        assert_eq!(header(&prepared, "api-key"), None);
        assert_eq!(prepared.body["model"], "gpt-4");
        assert_eq!(prepared.body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_azure_rewrite() {
        let executor = two_provider_executor();
        let prepared = executor
            .prepare(&endpoint("azure/gpt-4"), &[ChatMessage::user("hi")], None)
            .expect("prepare");

        assert_eq!(
            prepared.url.as_str(),
            "https://res.azure.openai.com/openai/deployments/gpt-4/chat/completions?api-version=2023-05-15"
        );
        assert_eq!(header(&prepared, "api-key"), Some("azure-key"));
        assert_eq!(header(&prepared, "authorization"), None);
        // Azure body omits the model field
        assert!(prepared.body.get("model").is_none());
        assert_eq!(prepared.body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_azure_key_derived_from_openai_bearer() {
        // Single openai template; the bearer token is the key for the azure
        // rewrite when only an azure-shaped template exists.
        let executor = executor(
            r#"
models = ["azure/gpt-4"]

[[clients]]
url = "https://res.azure.openai.com/base"
[clients.headers]
Authorization = "Bearer shared-token"
"#,
        );
        let prepared = executor
            .prepare(&endpoint("azure/gpt-4"), &[ChatMessage::user("hi")], None)
            .expect("prepare");

        assert_eq!(header(&prepared, "api-key"), Some("shared-token"));
        assert_eq!(header(&prepared, "authorization"), None);
    }

    #[test]
    fn test_vertex_body_shape() {
        let executor = executor(
            r#"
models = ["vertex/gemini-pro/us-east4"]

[[clients]]
url = "https://us-east4-aiplatform.googleapis.com/v1/projects/p/models/gemini:generateContent"
[clients.headers]
Authorization = "Bearer oauth-token"
"#,
        );
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("again"),
        ];
        let prepared = executor
            .prepare(&endpoint("vertex/gemini-pro/us-east4"), &messages, None)
            .expect("prepare");

        // Template URL and headers pass through untouched
        assert!(prepared.url.as_str().contains("googleapis.com"));
        assert_eq!(header(&prepared, "authorization"), Some("Bearer oauth-token"));

        let contents = prepared.body["contents"].as_array().expect("contents");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            prepared.body["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
    }

    #[test]
    fn test_original_call_reused_for_matching_endpoint() {
        let executor = two_provider_executor();
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer caller-token".to_string());
        headers.insert("X-Custom".to_string(), "yes".to_string());
        let original = OriginalCall {
            endpoint: endpoint("openai/gpt-4"),
            url: "https://api.openai.com/v1/chat/completions?caller=1".to_string(),
            headers,
        };

        let prepared = executor
            .prepare(
                &endpoint("openai/gpt-4"),
                &[ChatMessage::user("hi")],
                Some(&original),
            )
            .expect("prepare");

        assert_eq!(
            prepared.url.as_str(),
            "https://api.openai.com/v1/chat/completions?caller=1"
        );
        assert_eq!(header(&prepared, "authorization"), Some("Bearer caller-token"));
        assert_eq!(header(&prepared, "x-custom"), Some("yes"));
    }

    #[test]
    fn test_original_call_ignored_for_other_endpoint() {
        let executor = two_provider_executor();
        let original = OriginalCall {
            endpoint: endpoint("openai/gpt-4"),
            url: "https://api.openai.com/v1/chat/completions".to_string(),
            headers: BTreeMap::new(),
        };

        let prepared = executor
            .prepare(
                &endpoint("azure/gpt-4"),
                &[ChatMessage::user("hi")],
                Some(&original),
            )
            .expect("prepare");

        assert!(prepared.url.as_str().starts_with("https://res.azure.openai.com/"));
        assert_eq!(header(&prepared, "api-key"), Some("azure-key"));
    }

    #[test]
    fn test_prefix_messages_prepended() {
        let executor = executor(
            r#"
models = ["openai/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-live"

[[model_messages."openai/gpt-4"]]
role = "system"
content = "endpoint persona"
"#,
        );
        let prepared = executor
            .prepare(&endpoint("openai/gpt-4"), &[ChatMessage::user("hi")], None)
            .expect("prepare");

        let messages = prepared.body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "endpoint persona");
    }

    #[test]
    fn test_invalid_sequence_fails_before_any_http() {
        let executor = executor(
            r#"
models = ["openai/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-live"

[[model_messages."openai/gpt-4"]]
role = "assistant"
content = "I go first"
"#,
        );
        let result = executor.prepare(&endpoint("openai/gpt-4"), &[ChatMessage::user("hi")], None);
        assert!(matches!(
            result,
            Err(RelayError::InvalidMessageSequence(_))
        ));
    }

    #[test]
    fn test_extract_error_message_from_json() {
        let body = br#"{"error": {"message": "quota exceeded", "type": "rate_limit"}}"#;
        assert_eq!(extract_error_message(body), "quota exceeded");
    }

    #[test]
    fn test_extract_error_message_falls_back_to_raw_body() {
        let body = b"upstream exploded";
        assert_eq!(extract_error_message(body), "upstream exploded");
    }
}
