use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::RequestBuilder;
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

const CLASSIFY_TEMPERATURE: f32 = 0.0;
const SCORING_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Azure,
    OpenAi,
}

/// Chat-completions client for Azure OpenAI deployments and OpenAI-compatible APIs.
pub struct CompletionsProvider {
    client: reqwest::Client,
    flavor: Flavor,
    secret: ApiSecret,
    model: String,
    chat_url: String,
    health_url: String,
}

impl CompletionsProvider {
    pub fn azure(
        client: reqwest::Client,
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        secret: ApiSecret,
    ) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        Self {
            client,
            flavor: Flavor::Azure,
            secret,
            model: deployment.to_string(),
            chat_url: format!(
                "{endpoint}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            ),
            health_url: format!("{endpoint}/openai/models?api-version={api_version}"),
        }
    }

    pub fn openai_compatible(
        client: reqwest::Client,
        base_url: &str,
        model: &str,
        secret: ApiSecret,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            client,
            flavor: Flavor::OpenAi,
            secret,
            model: model.to_string(),
            chat_url: format!("{base_url}/v1/chat/completions"),
            health_url: format!("{base_url}/v1/models"),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.flavor {
            Flavor::Azure => request.header("api-key", self.secret.expose()),
            Flavor::OpenAi => request.bearer_auth(self.secret.expose()),
        }
    }

    fn request_body(&self, prompt: &Prompt, temperature: f32) -> JsonValue {
        let mut body = json!({
            "messages": prompt.to_chat_messages(),
            "temperature": temperature,
        });
        // Azure routes by deployment path; the model field is only for OpenAI-style APIs.
        if self.flavor == Flavor::OpenAi {
            body["model"] = JsonValue::String(self.model.clone());
        }
        body
    }

    async fn complete(&self, prompt: &Prompt, temperature: f32) -> AppResult<Completion> {
        let correlation_id = Uuid::new_v4().to_string();
        let body = self.request_body(prompt, temperature);
        let request = self.authorize(self.client.post(&self.chat_url));

        let (payload, latency_ms) = send_json(request, &body, self.kind(), &correlation_id).await?;

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| missing_content(self.kind(), &correlation_id, "choices[0].message.content"))?
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
impl ClassificationProvider for CompletionsProvider {
    fn kind(&self) -> ProviderKind {
        match self.flavor {
            Flavor::Azure => ProviderKind::AzureOpenAi,
            Flavor::OpenAi => ProviderKind::OpenAiCompatible,
        }
    }

    async fn classify(
        &self,
        batch: &ClassificationBatch,
    ) -> AppResult<ProviderReply<Vec<ClassificationResult>>> {
        if batch.is_empty() {
            return Ok(empty_reply(Uuid::new_v4().to_string()));
        }
        let prompt = build_classification_prompt(batch);
        let completion = self.complete(&prompt, CLASSIFY_TEMPERATURE).await?;
        Ok(completion.into_classification(batch.len()))
    }

    async fn health_check(&self) -> bool {
        probe(self.authorize(self.client.get(&self.health_url)), self.kind()).await
    }

    async fn score_evaluation(
        &self,
        request: &ScoreEvaluationRequest,
    ) -> AppResult<ProviderReply<HashMap<i64, LlmCategoryScore>>> {
        if request.breakdown.is_empty() {
            return Ok(empty_reply(Uuid::new_v4().to_string()));
        }
        let prompt = build_scoring_prompt(request);
        let completion = self.complete(&prompt, SCORING_TEMPERATURE).await?;
        Ok(completion.into_scores(&request.category_ids()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[test]
    fn azure_urls_carry_deployment_and_api_version() {
        let provider = CompletionsProvider::azure(
            client(),
            "https://acme.openai.azure.com/",
            "kpi-gpt4o",
            "2024-02-01",
            ApiSecret::new("k"),
        );
        assert_eq!(
            provider.chat_url,
            "https://acme.openai.azure.com/openai/deployments/kpi-gpt4o/chat/completions?api-version=2024-02-01"
        );
        assert_eq!(
            provider.health_url,
            "https://acme.openai.azure.com/openai/models?api-version=2024-02-01"
        );
        assert_eq!(provider.kind(), ProviderKind::AzureOpenAi);
    }

    #[test]
    fn openai_body_names_the_model_and_azure_body_does_not() {
        let prompt = Prompt { messages: Vec::new() };
        let openai = CompletionsProvider::openai_compatible(
            client(),
            "http://localhost:9000",
            "gpt-4o-mini",
            ApiSecret::new("k"),
        );
        assert_eq!(openai.request_body(&prompt, 0.0)["model"], "gpt-4o-mini");
        assert_eq!(openai.chat_url, "http://localhost:9000/v1/chat/completions");

        let azure = CompletionsProvider::azure(
            client(),
            "http://localhost:9000",
            "dep",
            "2024-02-01",
            ApiSecret::new("k"),
        );
        assert!(azure.request_body(&prompt, 0.0).get("model").is_none());
    }
}
