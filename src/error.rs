//! Error types for modelrelay
//!
//! All errors implement `IntoResponse` for Axum handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}{remediation}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
        remediation: String,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config file '{path}' failed validation: {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Config file '{path}' already exists, refusing to overwrite")]
    ConfigFileExists { path: String },

    #[error("Failed to write config file '{path}': {source}{remediation}")]
    ConfigFileWrite {
        path: String,
        #[source]
        source: std::io::Error,
        remediation: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid message sequence: {0}")]
    InvalidMessageSequence(String),

    #[error("Endpoint {endpoint} is not admissible: {reason}")]
    EndpointInadmissible { endpoint: String, reason: String },

    #[error("Transport failure contacting {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Upstream {endpoint} returned HTTP {status}: {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Endpoint {endpoint} became unhealthy after HTTP {status}: {reason}")]
    EndpointBecameUnhealthy {
        endpoint: String,
        status: u16,
        reason: String,
    },

    #[error("Request cancelled by the caller")]
    Cancelled,

    #[error("All candidate endpoints failed, last error: {0}")]
    AllFailed(#[source] Box<RelayError>),

    #[error("Sample store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status code this error surfaces as to the caller
    ///
    /// Upstream HTTP errors are propagated with their original status so that
    /// exhausted dispatches stay transparent to the application.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidMessageSequence(_) => StatusCode::BAD_REQUEST,
            Self::EndpointInadmissible { .. } | Self::EndpointBecameUnhealthy { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            // 499 is the conventional client-closed-request code
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
            }
            Self::Http { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::AllFailed(last) => last.status_code(),
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. }
            | Self::ConfigFileExists { .. }
            | Self::ConfigFileWrite { .. }
            | Self::Store(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results
pub type RelayResult<T> = Result<T, RelayError>;
