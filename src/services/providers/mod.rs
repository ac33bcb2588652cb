//! Classification backends. Every backend shares prompt construction and response
//! extraction; they differ only in endpoint, auth header and envelope.

mod completions;
mod local;
mod raw_prompt;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, ProviderErrorCode};
use crate::models::classification::{
    ClassificationBatch, ClassificationResult, ProviderReply, TokenUsage,
};
use crate::models::credential::{Credential, ProviderKind};
use crate::models::evaluation::{LlmCategoryScore, ScoreEvaluationRequest};
use crate::models::settings::DispatchSettings;
use crate::services::extractor::{extract_classifications, extract_scores};
use crate::utils::crypto::ApiSecret;
use crate::utils::redact::redact_sensitive_data;

pub use completions::CompletionsProvider;
pub use local::LocalRuleProvider;
pub use raw_prompt::RawPromptProvider;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";
pub const HUGGING_FACE_INFERENCE_BASE: &str = "https://api-inference.huggingface.co/models";

const USER_AGENT: &str = concat!("workpulse/", env!("CARGO_PKG_VERSION"));
const BODY_EXCERPT_LIMIT: usize = 512;

#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Classifies every description in the batch. The reply always carries
    /// `batch.len()` results.
    async fn classify(
        &self,
        batch: &ClassificationBatch,
    ) -> AppResult<ProviderReply<Vec<ClassificationResult>>>;

    /// Cheap reachability probe. Never errors.
    async fn health_check(&self) -> bool;

    /// Model-adjusted category scores keyed by category id. Unusable output
    /// yields an empty map.
    async fn score_evaluation(
        &self,
        request: &ScoreEvaluationRequest,
    ) -> AppResult<ProviderReply<HashMap<i64, LlmCategoryScore>>>;
}

/// Builds provider clients from stored credentials over one shared HTTP client.
#[derive(Clone)]
pub struct ProviderFactory {
    client: reqwest::Client,
}

impl ProviderFactory {
    pub fn new(settings: &DispatchSettings) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(settings.http_timeout)?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn connect(
        &self,
        credential: &Credential,
        secret: Option<ApiSecret>,
    ) -> AppResult<Box<dyn ClassificationProvider>> {
        if credential.provider == ProviderKind::Local {
            return Ok(Box::new(LocalRuleProvider::new()));
        }

        let secret = secret.ok_or_else(|| {
            AppError::credential(Some(credential.id), "credential has no usable secret")
        })?;

        match credential.provider {
            ProviderKind::AzureOpenAi => {
                let endpoint = required(credential, credential.endpoint.as_deref(), "endpoint")?;
                let deployment = required(credential, credential.model.as_deref(), "deployment")?;
                let api_version = credential
                    .api_version
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .unwrap_or(DEFAULT_AZURE_API_VERSION);
                Ok(Box::new(CompletionsProvider::azure(
                    self.client.clone(),
                    endpoint,
                    deployment,
                    api_version,
                    secret,
                )))
            }
            ProviderKind::OpenAiCompatible => {
                let base_url = optional(credential.endpoint.as_deref())
                    .unwrap_or(DEFAULT_OPENAI_BASE_URL);
                let model = optional(credential.model.as_deref()).unwrap_or(DEFAULT_OPENAI_MODEL);
                Ok(Box::new(CompletionsProvider::openai_compatible(
                    self.client.clone(),
                    base_url,
                    model,
                    secret,
                )))
            }
            ProviderKind::HuggingFace => {
                let endpoint = match (
                    optional(credential.endpoint.as_deref()),
                    optional(credential.model.as_deref()),
                ) {
                    (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
                    (None, Some(model)) => format!("{HUGGING_FACE_INFERENCE_BASE}/{model}"),
                    (None, None) => {
                        return Err(AppError::credential(
                            Some(credential.id),
                            "hugging face credential needs a model or an endpoint",
                        ))
                    }
                };
                Ok(Box::new(RawPromptProvider::new(
                    self.client.clone(),
                    endpoint,
                    secret,
                )))
            }
            ProviderKind::Local => Ok(Box::new(LocalRuleProvider::new())),
        }
    }
}

pub fn build_http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .build()
        .map_err(|err| AppError::other(format!("failed to build HTTP client: {err}")))
}

fn optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn required<'a>(credential: &Credential, value: Option<&'a str>, field: &str) -> AppResult<&'a str> {
    optional(value).ok_or_else(|| {
        AppError::credential(
            Some(credential.id),
            format!("{} credential is missing its {field}", credential.provider),
        )
    })
}

/// Raw model text plus call metadata, before extraction.
pub(crate) struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub correlation_id: String,
    pub latency_ms: u128,
}

impl Completion {
    pub fn into_classification(self, expected: usize) -> ProviderReply<Vec<ClassificationResult>> {
        let extraction = extract_classifications(&self.text, expected);
        let parsed = extraction.parsed;
        if parsed < expected {
            debug!(
                target: "app::providers",
                correlation_id = %self.correlation_id,
                expected,
                parsed,
                "classification output padded with sentinels"
            );
        }
        ProviderReply {
            value: extraction.into_results(expected),
            parsed,
            usage: self.usage,
            correlation_id: self.correlation_id,
            latency_ms: self.latency_ms,
        }
    }

    pub fn into_scores(self, allowed_ids: &[i64]) -> ProviderReply<HashMap<i64, LlmCategoryScore>> {
        let scores = extract_scores(&self.text, allowed_ids);
        ProviderReply {
            parsed: scores.len(),
            value: scores,
            usage: self.usage,
            correlation_id: self.correlation_id,
            latency_ms: self.latency_ms,
        }
    }
}

pub(crate) fn empty_reply<T: Default>(correlation_id: String) -> ProviderReply<T> {
    ProviderReply {
        value: T::default(),
        parsed: 0,
        usage: None,
        correlation_id,
        latency_ms: 0,
    }
}

/// Sends a JSON request, logging a redacted copy of the body, and returns the
/// decoded JSON response with its latency.
pub(crate) async fn send_json(
    request: RequestBuilder,
    body: &JsonValue,
    kind: ProviderKind,
    correlation_id: &str,
) -> AppResult<(JsonValue, u128)> {
    let sanitized = redact_sensitive_data(body);
    debug!(
        target: "app::providers",
        provider = %kind,
        correlation_id = %correlation_id,
        payload = %sanitized,
        "invoking provider"
    );

    let start = Instant::now();
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|err| error_from_reqwest(err, kind, correlation_id))?;

    let status = response.status();
    let latency_ms = start.elapsed().as_millis();

    if !status.is_success() {
        let excerpt: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(BODY_EXCERPT_LIMIT)
            .collect();
        warn!(
            target: "app::providers",
            provider = %kind,
            correlation_id = %correlation_id,
            status = status.as_u16(),
            latency_ms,
            "provider returned non-success status"
        );
        return Err(map_http_error(status, kind, correlation_id, Some(excerpt)));
    }

    let payload: JsonValue = response.json().await.map_err(|err| {
        AppError::provider_with_details(
            ProviderErrorCode::InvalidResponse,
            format!("{kind} response is not valid JSON"),
            Some(status.as_u16()),
            Some(correlation_id),
            Some(json!({ "reason": err.to_string() })),
        )
    })?;

    debug!(
        target: "app::providers",
        provider = %kind,
        correlation_id = %correlation_id,
        latency_ms,
        "provider responded"
    );

    Ok((payload, latency_ms))
}

/// GET probe used by health checks; any transport error or non-2xx is unhealthy.
pub(crate) async fn probe(request: RequestBuilder, kind: ProviderKind) -> bool {
    match request.send().await {
        Ok(response) => {
            let healthy = response.status().is_success();
            debug!(
                target: "app::providers",
                provider = %kind,
                status = response.status().as_u16(),
                healthy,
                "health probe finished"
            );
            healthy
        }
        Err(err) => {
            debug!(target: "app::providers", provider = %kind, error = %err, "health probe failed");
            false
        }
    }
}

pub(crate) fn map_http_error(
    status: StatusCode,
    kind: ProviderKind,
    correlation_id: &str,
    body_excerpt: Option<String>,
) -> AppError {
    let (code, message) = match status {
        StatusCode::UNAUTHORIZED => (
            ProviderErrorCode::Unauthorized,
            format!("{kind} rejected the credential"),
        ),
        StatusCode::FORBIDDEN => (
            ProviderErrorCode::Forbidden,
            format!("{kind} denied access for this credential"),
        ),
        StatusCode::TOO_MANY_REQUESTS => (
            ProviderErrorCode::RateLimited,
            format!("{kind} rate limit reached"),
        ),
        status if status.is_server_error() => (
            ProviderErrorCode::Unavailable,
            format!("{kind} unavailable (status {})", status.as_u16()),
        ),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => (
            ProviderErrorCode::InvalidRequest,
            format!("{kind} rejected the request (status {})", status.as_u16()),
        ),
        status => (
            ProviderErrorCode::Unknown,
            format!("{kind} returned status {}", status.as_u16()),
        ),
    };

    let details = body_excerpt
        .filter(|excerpt| !excerpt.is_empty())
        .map(|excerpt| json!({ "body": excerpt }));

    AppError::provider_with_details(
        code,
        message,
        Some(status.as_u16()),
        Some(correlation_id),
        details,
    )
}

pub(crate) fn error_from_reqwest(
    err: reqwest::Error,
    kind: ProviderKind,
    correlation_id: &str,
) -> AppError {
    if err.is_timeout() {
        AppError::provider_with_details(
            ProviderErrorCode::HttpTimeout,
            format!("{kind} request timed out"),
            None,
            Some(correlation_id),
            None,
        )
    } else if err.is_connect() {
        AppError::provider_with_details(
            ProviderErrorCode::Unavailable,
            format!("{kind} connection failed"),
            None,
            Some(correlation_id),
            None,
        )
    } else if let Some(status) = err.status() {
        map_http_error(status, kind, correlation_id, None)
    } else {
        AppError::provider_with_details(
            ProviderErrorCode::Unknown,
            format!("{kind} request failed: {err}"),
            None,
            Some(correlation_id),
            None,
        )
    }
}

pub(crate) fn missing_content(kind: ProviderKind, correlation_id: &str, field: &str) -> AppError {
    AppError::provider_with_details(
        ProviderErrorCode::InvalidResponse,
        format!("{kind} response has no {field}"),
        None,
        Some(correlation_id),
        Some(json!({ "reason": "missing_content" })),
    )
}

const PROMPT_TOKEN_PATHS: &[&str] = &[
    "/usage/prompt_tokens",
    "/usage/promptTokens",
    "/usage/input_tokens",
    "/usageMetadata/promptTokenCount",
    "/details/prompt_tokens",
];
const COMPLETION_TOKEN_PATHS: &[&str] = &[
    "/usage/completion_tokens",
    "/usage/completionTokens",
    "/usage/output_tokens",
    "/usageMetadata/candidatesTokenCount",
    "/details/generated_tokens",
];
const TOTAL_TOKEN_PATHS: &[&str] = &[
    "/usage/total_tokens",
    "/usage/totalTokens",
    "/usageMetadata/totalTokenCount",
    "/details/total_tokens",
];

/// Token counters from whichever usage layout the backend uses. Array responses
/// are probed through their first element.
pub fn extract_usage(body: &JsonValue) -> Option<TokenUsage> {
    let root = match body {
        JsonValue::Array(items) => items.first()?,
        other => other,
    };

    let first_count = |paths: &[&str]| {
        paths
            .iter()
            .find_map(|path| root.pointer(path).and_then(JsonValue::as_u64))
    };

    let mut usage = TokenUsage {
        prompt_tokens: first_count(PROMPT_TOKEN_PATHS),
        completion_tokens: first_count(COMPLETION_TOKEN_PATHS),
        total_tokens: first_count(TOTAL_TOKEN_PATHS),
    };
    if usage.total_tokens.is_none() {
        usage.total_tokens = match (usage.prompt_tokens, usage.completion_tokens) {
            (Some(prompt), Some(completion)) => Some(prompt + completion),
            (None, Some(completion)) => Some(completion),
            _ => None,
        };
    }

    if usage.is_empty() {
        None
    } else {
        Some(usage)
    }
}

pub mod testing {
    use super::*;

    /// Exposes status mapping to integration tests without widening the public API.
    pub fn map_http_error(status: StatusCode, kind: ProviderKind) -> AppError {
        super::map_http_error(status, kind, "test-correlation-id", None)
    }
}
