//! Embedding layer configuration.
//!
//! One flat struct covering provider selection, request shaping, and
//! the resilience knobs (retry, client-side rate limit, cost budget).
//! All fields have serde defaults so a partial config file works.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cost::CostConfig;
use crate::error::EmbeddingError;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;

/// Payload and response dialect of the embedding endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    HuggingFace,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `"api"` for a real provider, `"stub"` for deterministic local
    /// vectors (tests, offline development).
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub provider: ProviderKind,

    /// Endpoint URL; required in `api` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Full `Authorization` header value, e.g. `Bearer sk-...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_auth_header: Option<String>,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Expected vector length; mismatching responses are rejected.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// L2-normalize vectors before handing them out. Keeps cosine and
    /// inner-product rankings consistent.
    #[serde(default = "default_normalize")]
    pub normalize: bool,

    /// Per-request deadline applied on the HTTP call itself.
    #[serde(with = "crate::serde_millis", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Client-side token bucket; `None` disables local throttling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub cost: CostConfig,
}

fn default_mode() -> String {
    "stub".to_string()
}

fn default_model_name() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_normalize() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            provider: ProviderKind::default(),
            api_url: None,
            api_auth_header: None,
            model_name: default_model_name(),
            dimension: default_dimension(),
            normalize: default_normalize(),
            request_timeout: default_request_timeout(),
            retry: RetryConfig::default(),
            rate_limit: None,
            cost: CostConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn validate(&self) -> Result<(), EmbeddingError> {
        match self.mode.as_str() {
            "api" => {
                if self.api_url.as_deref().unwrap_or("").is_empty() {
                    return Err(EmbeddingError::InvalidConfig(
                        "api_url is required in api mode".into(),
                    ));
                }
            }
            "stub" => {}
            other => {
                return Err(EmbeddingError::InvalidConfig(format!(
                    "unknown mode `{other}` (expected `api` or `stub`)"
                )));
            }
        }
        if self.dimension == 0 {
            return Err(EmbeddingError::InvalidConfig(
                "dimension must be positive".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(EmbeddingError::InvalidConfig(
                "request_timeout must be positive".into(),
            ));
        }
        self.retry.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EmbeddingConfig::default().validate().is_ok());
    }

    #[test]
    fn api_mode_requires_url() {
        let cfg = EmbeddingConfig::default().with_mode("api");
        assert!(matches!(
            cfg.validate(),
            Err(EmbeddingError::InvalidConfig(_))
        ));

        let cfg = cfg.with_api_url("https://api.example.test/v1/embeddings");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_mode_rejected() {
        let cfg = EmbeddingConfig::default().with_mode("onnx");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_dimension_rejected() {
        let cfg = EmbeddingConfig::default().with_dimension(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serde_round_trip_with_millis_timeout() {
        let cfg = EmbeddingConfig::default();
        let raw = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(raw["request_timeout"], 10_000);
        let back: EmbeddingConfig = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(back.request_timeout, cfg.request_timeout);
        assert_eq!(back.mode, cfg.mode);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: EmbeddingConfig =
            serde_json::from_str(r#"{ "mode": "stub", "dimension": 16 }"#).expect("deserialize");
        assert_eq!(cfg.dimension, 16);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.normalize);
    }
}
