use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use super::{
    empty_reply, extract_usage, missing_content, probe, send_json, ClassificationProvider,
    Completion,
};
use crate::error::AppResult;
use crate::models::classification::{ClassificationBatch, ClassificationResult, ProviderReply};
use crate::models::credential::ProviderKind;
use crate::models::evaluation::{LlmCategoryScore, ScoreEvaluationRequest};
use crate::services::prompt_templates::{build_classification_prompt, build_scoring_prompt, Prompt};
use crate::utils::crypto::ApiSecret;

const MAX_NEW_TOKENS: u32 = 768;

/// Hosted text-generation inference: flattened prompt in, `generated_text` out.
pub struct RawPromptProvider {
    client: reqwest::Client,
    endpoint: String,
    secret: ApiSecret,
}

impl RawPromptProvider {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, secret: ApiSecret) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            secret,
        }
    }

    fn request_body(prompt: &Prompt) -> JsonValue {
        json!({
            "inputs": prompt.to_transcript(),
            "parameters": {
                "max_new_tokens": MAX_NEW_TOKENS,
                "temperature": 0.1,
                "return_full_text": false,
                "details": true,
            },
            "options": { "wait_for_model": true },
        })
    }

    fn generated_text(payload: &JsonValue) -> Option<&str> {
        match payload {
            JsonValue::Array(items) => items
                .first()
                .and_then(|item| item.get("generated_text"))
                .and_then(JsonValue::as_str),
            other => other.get("generated_text").and_then(JsonValue::as_str),
        }
    }

    async fn complete(&self, prompt: &Prompt) -> AppResult<Completion> {
        let correlation_id = Uuid::new_v4().to_string();
        let body = Self::request_body(prompt);
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.secret.expose());

        let (payload, latency_ms) =
            send_json(request, &body, ProviderKind::HuggingFace, &correlation_id).await?;

        let text = Self::generated_text(&payload)
            .ok_or_else(|| missing_content(ProviderKind::HuggingFace, &correlation_id, "generated_text"))?
            .to_string();

        Ok(Completion {
            text,
            usage: extract_usage(&payload),
            correlation_id,
            latency_ms,
        })
    }
}

#[async_trait]
impl ClassificationProvider for RawPromptProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HuggingFace
    }

    async fn classify(
        &self,
        batch: &ClassificationBatch,
    ) -> AppResult<ProviderReply<Vec<ClassificationResult>>> {
        if batch.is_empty() {
            return Ok(empty_reply(Uuid::new_v4().to_string()));
        }
        let completion = self.complete(&build_classification_prompt(batch)).await?;
        Ok(completion.into_classification(batch.len()))
    }

    async fn health_check(&self) -> bool {
        let request = self
            .client
            .get(&self.endpoint)
            .bearer_auth(self.secret.expose());
        probe(request, ProviderKind::HuggingFace).await
    }

    async fn score_evaluation(
        &self,
        request: &ScoreEvaluationRequest,
    ) -> AppResult<ProviderReply<HashMap<i64, LlmCategoryScore>>> {
        if request.breakdown.is_empty() {
            return Ok(empty_reply(Uuid::new_v4().to_string()));
        }
        let completion = self.complete(&build_scoring_prompt(request)).await?;
        Ok(completion.into_scores(&request.category_ids()))
    }
}
