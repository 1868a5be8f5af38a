//! Configuration management for modelrelay
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Configuration is immutable after construction: `from_file` and `from_str`
//! validate everything up front so the dispatch path never re-checks shape.

use crate::endpoint::{EndpointId, Provider};
use crate::message::ChatMessage;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default attempt budget when no per-endpoint or per-status budget applies
pub const DEFAULT_MAX_RETRIES: u32 = 1;
/// Default per-attempt deadline in seconds
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 100.0;
/// Default delay between attempts of the same endpoint, in seconds
pub const DEFAULT_BACKOFF_SECONDS: f64 = 1.0;
/// Upper clamp for latency rolling windows
pub const MAX_LATENCY_WINDOW: u32 = 10;
/// Upper clamp for recovery durations, in seconds (one hour)
pub const MAX_RECOVERY_SECONDS: f64 = 3600.0;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    clients: Vec<ClientTemplate>,
    models: ModelsPolicy,
    #[serde(default)]
    max_retries: HashMap<EndpointId, u32>,
    #[serde(default)]
    timeout: HashMap<EndpointId, f64>,
    #[serde(default)]
    backoff: HashMap<EndpointId, f64>,
    #[serde(default)]
    status_code_retry: Option<StatusRetryPolicy>,
    #[serde(default)]
    model_messages: HashMap<EndpointId, Vec<ChatMessage>>,
    #[serde(default)]
    model_latency: HashMap<EndpointId, LatencyTracking>,
    #[serde(default)]
    model_error_tracking: HashMap<EndpointId, HashMap<UpstreamStatus, ErrorTracking>>,
    #[serde(default)]
    model_limits: ModelLimits,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    retention: RetentionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Template request for one provider: target URL, default headers, credentials
///
/// Templates are read-only prototypes. Every attempt deep-clones the matching
/// template before applying provider-specific rewrites.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientTemplate {
    url: String,
    /// Explicit provider tag; defaults to matching the provider name against
    /// the URL host
    #[serde(default)]
    provider: Option<Provider>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl ClientTemplate {
    /// Construct a template (used by tests; config files deserialize directly)
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            provider: None,
            headers,
        }
    }

    /// Whether this template serves the given provider
    pub fn serves(&self, provider: Provider) -> bool {
        match self.provider {
            Some(tagged) => tagged == provider,
            None => provider.matches_host(&self.host()),
        }
    }

    /// Get the target URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the default headers
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Host portion of the template URL
    ///
    /// Validation guarantees the URL parses and carries a host.
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Derive the credential key for alternate-provider rewriting
    ///
    /// A bearer token in `Authorization` wins; otherwise the `api-key` header
    /// value is used.
    pub fn api_key(&self) -> Option<String> {
        if let Some(auth) = self.header_value("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
        self.header_value("api-key").map(str::to_string)
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Model pool: either an ordered preference list or a weighted mapping
///
/// The two shapes are distinguished once at deserialization, never re-sniffed.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelsPolicy {
    /// Candidates in declaration order
    Ordered(Vec<EndpointId>),
    /// Candidates drawn by weighted roulette without replacement
    Weighted(HashMap<EndpointId, f64>),
}

impl ModelsPolicy {
    /// All configured endpoints (declaration order for Ordered, arbitrary for Weighted)
    pub fn endpoints(&self) -> Vec<EndpointId> {
        match self {
            ModelsPolicy::Ordered(list) => list.clone(),
            ModelsPolicy::Weighted(map) => map.keys().cloned().collect(),
        }
    }

    /// Number of configured endpoints
    pub fn len(&self) -> usize {
        match self {
            ModelsPolicy::Ordered(list) => list.len(),
            ModelsPolicy::Weighted(map) => map.len(),
        }
    }

    /// Whether no endpoints are configured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An HTTP status code used as a configuration key
///
/// TOML keys are strings, so this parses `"429"` into a validated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamStatus(pub u16);

impl UpstreamStatus {
    /// Get the numeric code
    pub fn code(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for UpstreamStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatusVisitor;

        impl serde::de::Visitor<'_> for StatusVisitor {
            type Value = UpstreamStatus;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a three-digit HTTP status code")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let code: u64 = v
                    .parse()
                    .map_err(|_| E::custom(format!("'{}' is not a numeric status code", v)))?;
                self.visit_u64(code)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                if !(100..=599).contains(&v) {
                    return Err(E::custom(format!("status code {} out of range 100-599", v)));
                }
                Ok(UpstreamStatus(v as u16))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom(format!("status code {} out of range 100-599", v)));
                }
                self.visit_u64(v as u64)
            }
        }

        deserializer.deserialize_any(StatusVisitor)
    }
}

/// Status-aware retry budgets: per-endpoint nested form or global flat form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StatusRetryPolicy {
    /// endpoint -> (status -> budget)
    PerEndpoint(HashMap<EndpointId, HashMap<UpstreamStatus, u32>>),
    /// status -> budget, applied to every endpoint
    Global(HashMap<UpstreamStatus, u32>),
}

impl StatusRetryPolicy {
    /// Budget override for (endpoint, status), if configured
    pub fn budget(&self, endpoint: &EndpointId, status: u16) -> Option<u32> {
        let key = UpstreamStatus(status);
        match self {
            StatusRetryPolicy::PerEndpoint(map) => {
                map.get(endpoint).and_then(|per| per.get(&key)).copied()
            }
            StatusRetryPolicy::Global(map) => map.get(&key).copied(),
        }
    }
}

/// Latency health tracking parameters for one endpoint
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LatencyTracking {
    threshold_seconds: f64,
    window_size: u32,
    recovery_seconds: f64,
}

impl LatencyTracking {
    /// Construct tracking parameters (clamps apply on read)
    pub fn new(threshold_seconds: f64, window_size: u32, recovery_seconds: f64) -> Self {
        Self {
            threshold_seconds,
            window_size,
            recovery_seconds,
        }
    }

    /// Rolling-mean threshold in seconds
    pub fn threshold_seconds(&self) -> f64 {
        self.threshold_seconds
    }

    /// Window size, clamped to [1, 10]
    pub fn window_size(&self) -> usize {
        self.window_size.clamp(1, MAX_LATENCY_WINDOW) as usize
    }

    /// Recovery duration, clamped by the configured and absolute caps
    pub fn recovery(&self, limits: &ModelLimits) -> Duration {
        Duration::from_secs_f64(
            self.recovery_seconds
                .min(limits.max_recovery_seconds())
                .min(MAX_RECOVERY_SECONDS)
                .max(0.0),
        )
    }
}

/// Error-rate health tracking parameters for one (endpoint, status) pair
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ErrorTracking {
    error_percent_threshold: f64,
    window_size: u32,
    recovery_seconds: f64,
}

impl ErrorTracking {
    /// Construct tracking parameters (clamps apply on read)
    pub fn new(error_percent_threshold: f64, window_size: u32, recovery_seconds: f64) -> Self {
        Self {
            error_percent_threshold,
            window_size,
            recovery_seconds,
        }
    }

    /// Failure-rate threshold in percent
    pub fn error_percent_threshold(&self) -> f64 {
        self.error_percent_threshold
    }

    /// Window size (number of status samples considered)
    pub fn window_size(&self) -> usize {
        self.window_size.max(1) as usize
    }

    /// Recovery duration, clamped by the configured and absolute caps
    pub fn recovery(&self, limits: &ModelLimits) -> Duration {
        Duration::from_secs_f64(
            self.recovery_seconds
                .min(limits.max_recovery_seconds())
                .min(MAX_RECOVERY_SECONDS)
                .max(0.0),
        )
    }
}

/// Absolute caps shared by all endpoints
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ModelLimits {
    #[serde(default = "default_max_samples")]
    max_samples_per_endpoint: usize,
    #[serde(default = "default_max_recovery")]
    max_recovery_seconds: f64,
}

impl ModelLimits {
    /// Cap on retained samples per endpoint, per kind
    pub fn max_samples_per_endpoint(&self) -> usize {
        self.max_samples_per_endpoint
    }

    /// Cap on recovery durations, in seconds
    pub fn max_recovery_seconds(&self) -> f64 {
        self.max_recovery_seconds
    }
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            max_samples_per_endpoint: default_max_samples(),
            max_recovery_seconds: default_max_recovery(),
        }
    }
}

fn default_max_samples() -> usize {
    1000
}

fn default_max_recovery() -> f64 {
    MAX_RECOVERY_SECONDS
}

/// Sample store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Connection parameters for the sample store
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Connection address for remote backends, e.g. `redis://127.0.0.1:6379`
    #[serde(default)]
    pub address: Option<String>,
    /// Database index for remote backends
    #[serde(default)]
    pub db: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            address: None,
            db: 0,
        }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

/// Sample retention policy
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_seconds")]
    max_age_seconds: f64,
    /// Interval for the periodic eviction task; absent disables the task
    #[serde(default)]
    cleanup_interval_seconds: Option<f64>,
}

impl RetentionConfig {
    /// Maximum age of stored samples
    pub fn max_age(&self) -> Duration {
        Duration::from_secs_f64(self.max_age_seconds)
    }

    /// Periodic eviction interval, if enabled
    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_seconds.map(Duration::from_secs_f64)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: default_retention_seconds(),
            cleanup_interval_seconds: None,
        }
    }
}

fn default_retention_seconds() -> f64 {
    86_400.0
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::RelayResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            let remediation = match source.kind() {
                std::io::ErrorKind::NotFound => {
                    let current_dir = std::env::current_dir()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string());
                    format!(
                        "\nFile not found. Check that:\n\
                        1. Path '{}' is correct\n\
                        2. File exists and is readable\n\
                        3. Current working directory is: {}",
                        path_display, current_dir
                    )
                }
                std::io::ErrorKind::PermissionDenied => {
                    format!(
                        "\nPermission denied. Check that:\n\
                        1. File '{}' has read permissions (chmod +r)\n\
                        2. Parent directories have execute permissions (chmod +x)",
                        path_display
                    )
                }
                _ => String::new(),
            };

            crate::error::RelayError::ConfigFileRead {
                path: path_display.clone(),
                source,
                remediation,
            }
        })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let config: Self = toml::from_str(&content).map_err(|source| {
            crate::error::RelayError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 3: Validate parsed config (provides contextual reason)
        config
            .validate()
            .map_err(|e| crate::error::RelayError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Get the model pool policy
    pub fn models(&self) -> &ModelsPolicy {
        &self.models
    }

    /// Get the template requests
    pub fn clients(&self) -> &[ClientTemplate] {
        &self.clients
    }

    /// Find the template request for a provider
    ///
    /// An explicit `provider` tag on the template wins; otherwise the
    /// provider name is matched against the template URL host.
    pub fn template_for(&self, provider: Provider) -> Option<&ClientTemplate> {
        self.clients.iter().find(|t| t.serves(provider))
    }

    /// Default attempt budget for an endpoint
    pub fn max_retries(&self, endpoint: &EndpointId) -> u32 {
        self.max_retries
            .get(endpoint)
            .copied()
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Per-attempt deadline for an endpoint
    pub fn timeout(&self, endpoint: &EndpointId) -> Duration {
        Duration::from_secs_f64(
            self.timeout
                .get(endpoint)
                .copied()
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        )
    }

    /// Delay between attempts of the same endpoint; zero means no sleep
    pub fn backoff(&self, endpoint: &EndpointId) -> Duration {
        let seconds = self
            .backoff
            .get(endpoint)
            .copied()
            .unwrap_or(DEFAULT_BACKOFF_SECONDS);
        if seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(seconds)
        }
    }

    /// Resolve the attempt budget for an endpoint given the last observed status
    ///
    /// Resolution order: per-endpoint status budget, global status budget,
    /// per-endpoint default, global default of 1. A status of 0 means no
    /// response has been observed yet.
    pub fn retry_budget(&self, endpoint: &EndpointId, last_status: u16) -> u32 {
        if last_status != 0 {
            if let Some(budget) = self
                .status_code_retry
                .as_ref()
                .and_then(|p| p.budget(endpoint, last_status))
            {
                return budget;
            }
        }
        self.max_retries(endpoint)
    }

    /// Prefix messages prepended when this endpoint is attempted
    pub fn prefix_messages(&self, endpoint: &EndpointId) -> &[ChatMessage] {
        self.model_messages
            .get(endpoint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Latency tracking parameters for an endpoint, if configured
    pub fn latency_tracking(&self, endpoint: &EndpointId) -> Option<&LatencyTracking> {
        self.model_latency.get(endpoint)
    }

    /// Error-rate tracking parameters for an endpoint
    ///
    /// Entries are returned in ascending status order so verdicts are
    /// deterministic when several statuses trip at once.
    pub fn error_tracking(&self, endpoint: &EndpointId) -> Vec<(u16, &ErrorTracking)> {
        let mut entries: Vec<(u16, &ErrorTracking)> = self
            .model_error_tracking
            .get(endpoint)
            .map(|per| per.iter().map(|(s, t)| (s.code(), t)).collect())
            .unwrap_or_default();
        entries.sort_by_key(|(status, _)| *status);
        entries
    }

    /// Absolute caps shared by all endpoints
    pub fn limits(&self) -> &ModelLimits {
        &self.model_limits
    }

    /// Sample store connection parameters
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Sample retention policy
    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    /// Validate configuration after parsing
    ///
    /// This is called automatically by `from_file()`, but can also be called
    /// explicitly when constructing Config via other means (e.g., in tests).
    pub fn validate(&self) -> crate::error::RelayResult<()> {
        use crate::error::RelayError;

        if self.clients.is_empty() {
            return Err(RelayError::Config(
                "at least one client template is required".to_string(),
            ));
        }

        for template in &self.clients {
            let url = reqwest::Url::parse(template.url()).map_err(|e| {
                RelayError::Config(format!(
                    "client template URL '{}' does not parse: {}",
                    template.url(),
                    e
                ))
            })?;
            if url.host_str().is_none() {
                return Err(RelayError::Config(format!(
                    "client template URL '{}' has no host",
                    template.url()
                )));
            }
            if template.api_key().is_none() {
                return Err(RelayError::Config(format!(
                    "client template '{}' carries neither an Authorization bearer \
                    token nor an api-key header",
                    template.url()
                )));
            }
        }

        if self.models.is_empty() {
            return Err(RelayError::Config(
                "models must name at least one endpoint".to_string(),
            ));
        }

        // The providers named by models must be a subset of the providers
        // represented in clients.
        for endpoint in self.models.endpoints() {
            if self.template_for(endpoint.provider()).is_none() {
                return Err(RelayError::Config(format!(
                    "model '{}' names provider '{}' but no client template matches it",
                    endpoint,
                    endpoint.provider()
                )));
            }
        }

        match &self.models {
            ModelsPolicy::Ordered(list) => {
                let mut seen = std::collections::HashSet::new();
                for endpoint in list {
                    if !seen.insert(endpoint.clone()) {
                        return Err(RelayError::Config(format!(
                            "model '{}' appears more than once in the ordered list",
                            endpoint
                        )));
                    }
                }
            }
            ModelsPolicy::Weighted(map) => {
                for (endpoint, weight) in map {
                    if *weight <= 0.0 || !weight.is_finite() {
                        return Err(RelayError::Config(format!(
                            "model '{}' has invalid weight {}. \
                            Weight must be a positive finite number.",
                            endpoint, weight
                        )));
                    }
                }
            }
        }

        for (endpoint, budget) in &self.max_retries {
            if *budget == 0 {
                return Err(RelayError::Config(format!(
                    "max_retries for '{}' must be at least 1",
                    endpoint
                )));
            }
        }

        for (endpoint, seconds) in &self.timeout {
            if *seconds <= 0.0 || !seconds.is_finite() {
                return Err(RelayError::Config(format!(
                    "timeout for '{}' must be a positive finite number of seconds, got {}",
                    endpoint, seconds
                )));
            }
        }

        for (endpoint, seconds) in &self.backoff {
            if !seconds.is_finite() {
                return Err(RelayError::Config(format!(
                    "backoff for '{}' must be finite, got {}",
                    endpoint, seconds
                )));
            }
        }

        for (endpoint, tracking) in &self.model_latency {
            if tracking.threshold_seconds <= 0.0 || !tracking.threshold_seconds.is_finite() {
                return Err(RelayError::Config(format!(
                    "model_latency threshold for '{}' must be positive, got {}",
                    endpoint, tracking.threshold_seconds
                )));
            }
            if tracking.recovery_seconds < 0.0 || !tracking.recovery_seconds.is_finite() {
                return Err(RelayError::Config(format!(
                    "model_latency recovery for '{}' must be non-negative, got {}",
                    endpoint, tracking.recovery_seconds
                )));
            }
        }

        for (endpoint, per_status) in &self.model_error_tracking {
            for (status, tracking) in per_status {
                if tracking.error_percent_threshold <= 0.0
                    || tracking.error_percent_threshold > 100.0
                    || !tracking.error_percent_threshold.is_finite()
                {
                    return Err(RelayError::Config(format!(
                        "model_error_tracking threshold for '{}' status {} must be in \
                        (0, 100], got {}",
                        endpoint, status, tracking.error_percent_threshold
                    )));
                }
                if tracking.window_size == 0 {
                    return Err(RelayError::Config(format!(
                        "model_error_tracking window for '{}' status {} must be at least 1",
                        endpoint, status
                    )));
                }
            }
        }

        if self.model_limits.max_samples_per_endpoint == 0 {
            return Err(RelayError::Config(
                "model_limits.max_samples_per_endpoint must be at least 1".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.address.is_none() {
            return Err(RelayError::Config(
                "store.backend = \"redis\" requires store.address".to_string(),
            ));
        }

        if self.retention.max_age_seconds <= 0.0 {
            return Err(RelayError::Config(
                "retention.max_age_seconds must be positive".to_string(),
            ));
        }
        if let Some(interval) = self.retention.cleanup_interval_seconds {
            if interval <= 0.0 {
                return Err(RelayError::Config(
                    "retention.cleanup_interval_seconds must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = crate::error::RelayError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(toml_str).map_err(|source| {
            let path_with_context = format!(
                "<string> ({} bytes, {} lines)",
                toml_str.len(),
                toml_str.lines().count()
            );

            crate::error::RelayError::ConfigParseFailed {
                path: path_with_context,
                source,
            }
        })?;

        config.validate()?;
        Ok(config)
    }
}
