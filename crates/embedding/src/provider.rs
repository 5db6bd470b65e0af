//! Embedding provider trait and the HTTP client implementation.
//!
//! The wire dialects of the common providers differ only in payload
//! field names and response nesting, so one client covers them with a
//! [`ProviderKind`] switch and a tolerant response parser. Every call
//! goes through the token bucket (when configured), the bounded retry
//! loop, and the cost tracker.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::cost::{CostStats, CostTracker};
use crate::error::{EmbeddingError, ProviderFailure};
use crate::normalize::l2_normalize_in_place;
use crate::rate_limit::{RateLimitStats, TokenBucket};
use crate::retry::retry_with_backoff;

// Shared client with connection pooling; per-request deadlines come
// from the config.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(16)
        .build()
        .expect("failed to build HTTP client")
});

/// Text-in, vector-out provider seam.
///
/// Implementations must be safe to share across workers; the engine
/// holds one behind an `Arc` for the lifetime of a batch.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embeds one subject's profile text. `subject_id` is for
    /// diagnostics only and must not influence the vector.
    async fn embed(&self, subject_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;
}

/// HTTP-backed embedder for OpenAI-, HuggingFace-, and custom-shaped
/// endpoints.
pub struct HttpEmbeddingClient {
    config: EmbeddingConfig,
    limiter: Option<TokenBucket>,
    costs: CostTracker,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        config.validate()?;
        let limiter = config.rate_limit.map(TokenBucket::new);
        let costs = CostTracker::new(config.cost);
        Ok(Self {
            config,
            limiter,
            costs,
        })
    }

    pub fn cost_stats(&self) -> CostStats {
        self.costs.stats()
    }

    pub fn rate_limit_stats(&self) -> Option<RateLimitStats> {
        self.limiter.as_ref().map(|limiter| limiter.stats())
    }
}

#[async_trait]
impl TextEmbedder for HttpEmbeddingClient {
    async fn embed(&self, subject_id: &str, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(limiter) = &self.limiter {
            limiter
                .acquire()
                .await
                .map_err(|_| EmbeddingError::LimiterSaturated {
                    waited: limiter.max_wait(),
                })?;
        }

        let url = self
            .config
            .api_url
            .clone()
            .ok_or_else(|| EmbeddingError::InvalidConfig("api_url is required".into()))?;
        let auth = self.config.api_auth_header.clone();
        let timeout = self.config.request_timeout;
        let payload = build_payload(self.config.provider, &self.config.model_name, text);

        let response = retry_with_backoff(&self.config.retry, |attempt| {
            let url = url.clone();
            let auth = auth.clone();
            let payload = payload.clone();
            async move {
                if attempt > 0 {
                    tracing::debug!(attempt, "retrying embedding request");
                }
                send_embed_request(&url, auth.as_deref(), timeout, &payload).await
            }
        })
        .await?;

        let mut vector = parse_embedding(response)
            .map_err(|reason| EmbeddingError::Provider(ProviderFailure::Fatal(reason)))?;

        if vector.len() != self.config.dimension {
            return Err(EmbeddingError::Provider(ProviderFailure::Fatal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.config.dimension,
                vector.len()
            ))));
        }
        if self.config.normalize {
            l2_normalize_in_place(&mut vector);
        }

        let cost = self.costs.record(text.len());
        tracing::debug!(
            subject_id,
            dimension = vector.len(),
            cost_micros = cost,
            "embedding generated"
        );
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

fn build_payload(provider: ProviderKind, model_name: &str, text: &str) -> Value {
    match provider {
        ProviderKind::OpenAi => json!({ "model": model_name, "input": text }),
        ProviderKind::HuggingFace => json!({ "inputs": text }),
        ProviderKind::Custom => json!({ "text": text }),
    }
}

async fn send_embed_request(
    url: &str,
    auth: Option<&str>,
    timeout: Duration,
    payload: &Value,
) -> Result<Value, ProviderFailure> {
    let mut request = HTTP_CLIENT
        .post(url)
        .timeout(timeout)
        .header("Content-Type", "application/json");
    if let Some(header) = auth {
        request = request.header("Authorization", header);
    }

    let response = match request.json(payload).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Err(ProviderFailure::Timeout(timeout)),
        Err(e) => return Err(ProviderFailure::Transient(format!("request failed: {e}"))),
    };

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderFailure::RateLimited {
            retry_after: parse_retry_after(response.headers()),
        });
    }
    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderFailure::Transient(format!("HTTP {status}: {body}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderFailure::Fatal(format!("HTTP {status}: {body}")));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderFailure::Fatal(format!("invalid JSON response: {e}")))
}

/// Seconds form of `Retry-After`. The HTTP-date form is rare on
/// embedding APIs and falls back to our own schedule.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pulls a single vector out of the known response shapes:
/// `{"data": [{"embedding": [...]}]}` (OpenAI),
/// `{"embeddings": [[...]]}` / bare `[[...]]` / bare `[...]`
/// (HuggingFace-style), `{"embedding": [...]}` or `{"vector": [...]}`
/// (custom).
fn parse_embedding(value: Value) -> Result<Vec<f32>, String> {
    match value {
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove("data") {
                let first = items
                    .into_iter()
                    .next()
                    .ok_or_else(|| "empty `data` array".to_string())?;
                let Value::Object(mut entry) = first else {
                    return Err("unexpected entry inside `data` array".into());
                };
                let embedding = entry
                    .remove("embedding")
                    .ok_or_else(|| "missing `embedding` field in data item".to_string())?;
                return parse_vector(embedding);
            }
            if let Some(embeddings) = map.remove("embeddings") {
                return parse_first_vector(embeddings);
            }
            if let Some(flat) = map.remove("embedding").or_else(|| map.remove("vector")) {
                return parse_vector(flat);
            }
            Err("unsupported API response shape".into())
        }
        other => parse_first_vector(other),
    }
}

fn parse_first_vector(value: Value) -> Result<Vec<f32>, String> {
    match value {
        Value::Array(items) => {
            if let Some(Value::Array(_)) = items.first() {
                match items.into_iter().next() {
                    Some(first) => parse_vector(first),
                    None => Err("empty embeddings array".into()),
                }
            } else {
                parse_vector(Value::Array(items))
            }
        }
        other => parse_vector(other),
    }
}

fn parse_vector(value: Value) -> Result<Vec<f32>, String> {
    let Value::Array(items) = value else {
        return Err("embedding is not an array".into());
    };
    if items.is_empty() {
        return Err("embedding array is empty".into());
    }
    items
        .into_iter()
        .map(|item| {
            item.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| "non-numeric embedding component".to_string())
        })
        .collect()
}
