//! Endpoint identity types
//!
//! An endpoint is a `provider/model` or `provider/model/region` identity.
//! It is the key for health tracking, retry budgets, and the sample store.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing endpoint identity strings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("unknown provider '{0}' (expected one of: openai, azure, vertex)")]
    UnknownProvider(String),

    #[error("malformed endpoint '{0}' (expected provider/model or provider/model/region)")]
    Malformed(String),
}

/// Upstream LLM provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Azure,
    Vertex,
}

impl Provider {
    /// Canonical lowercase name as used in endpoint identities
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Azure => "azure",
            Provider::Vertex => "vertex",
        }
    }

    /// Whether a template URL host belongs to this provider
    ///
    /// Matching is by provider-substring in the host. Azure OpenAI hosts
    /// contain both "azure" and "openai", so the openai match excludes them.
    pub fn matches_host(&self, host: &str) -> bool {
        match self {
            Provider::OpenAi => host.contains("openai") && !host.contains("azure"),
            Provider::Azure => host.contains("azure"),
            Provider::Vertex => host.contains("vertex") || host.contains("googleapis"),
        }
    }
}

impl FromStr for Provider {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "azure" => Ok(Provider::Azure),
            "vertex" => Ok(Provider::Vertex),
            other => Err(EndpointError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `provider/model[/region]` endpoint identity
///
/// Identities are case-sensitive and normalized at construction: surrounding
/// whitespace is stripped and duplicate slashes are collapsed. Distinct
/// regions are distinct endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    provider: Provider,
    model: String,
    region: Option<String>,
}

impl EndpointId {
    /// Parse and normalize an endpoint identity string
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EndpointError::Malformed(raw.to_string()));
        }

        let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [provider, model] => Ok(Self {
                provider: provider.parse()?,
                model: (*model).to_string(),
                region: None,
            }),
            [provider, model, region] => Ok(Self {
                provider: provider.parse()?,
                model: (*model).to_string(),
                region: Some((*region).to_string()),
            }),
            _ => Err(EndpointError::Malformed(raw.to_string())),
        }
    }

    /// Construct from already-validated parts (used by the planner and tests)
    pub fn new(provider: Provider, model: impl Into<String>, region: Option<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            region,
        }
    }

    /// Get the provider
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Get the model name without the provider prefix
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the region, if any
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}/{}/{}", self.provider, self.model, region),
            None => write!(f, "{}/{}", self.provider, self.model),
        }
    }
}

impl FromStr for EndpointId {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        EndpointId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
