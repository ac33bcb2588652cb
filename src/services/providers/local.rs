use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::{empty_reply, ClassificationProvider};
use crate::error::AppResult;
use crate::models::classification::{ClassificationBatch, ClassificationResult, ProviderReply};
use crate::models::credential::ProviderKind;
use crate::models::evaluation::{LlmCategoryScore, ScoreEvaluationRequest};

const MIN_KEYWORD_LEN: usize = 3;
const STEM_LEN: usize = 5;
const BASE_CONFIDENCE: f64 = 0.5;
const CONFIDENCE_STEP: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 0.8;

/// Offline fallback: matches category-name keywords against each description.
#[derive(Debug, Clone, Default)]
pub struct LocalRuleProvider;

impl LocalRuleProvider {
    pub fn new() -> Self {
        Self
    }

    fn classify_one(description: &str, categories: &[String]) -> ClassificationResult {
        let words = tokenize(description);
        let mut best: Option<(&String, Vec<String>)> = None;

        for category in categories {
            let matched: Vec<String> = tokenize(category)
                .into_iter()
                .filter(|keyword| words.iter().any(|word| stems_match(word, keyword)))
                .collect();
            if matched.is_empty() {
                continue;
            }
            let better = best
                .as_ref()
                .map(|(_, current)| matched.len() > current.len())
                .unwrap_or(true);
            if better {
                best = Some((category, matched));
            }
        }

        match best {
            Some((category, matched)) => {
                let confidence = (BASE_CONFIDENCE
                    + CONFIDENCE_STEP * (matched.len().saturating_sub(1)) as f64)
                    .min(MAX_CONFIDENCE);
                ClassificationResult::new(
                    category.clone(),
                    confidence,
                    json!({ "source": "local", "matched": matched }),
                )
            }
            None => ClassificationResult::sentinel(),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Words match when they share a prefix of `STEM_LEN` chars, or the shorter word entirely.
fn stems_match(word: &str, keyword: &str) -> bool {
    let common = word
        .chars()
        .zip(keyword.chars())
        .take_while(|(a, b)| a == b)
        .count();
    let needed = STEM_LEN
        .min(word.chars().count())
        .min(keyword.chars().count());
    common >= needed
}

#[async_trait]
impl ClassificationProvider for LocalRuleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn classify(
        &self,
        batch: &ClassificationBatch,
    ) -> AppResult<ProviderReply<Vec<ClassificationResult>>> {
        let results: Vec<ClassificationResult> = batch
            .descriptions
            .iter()
            .map(|description| Self::classify_one(description, &batch.categories))
            .collect();
        Ok(ProviderReply {
            parsed: results.len(),
            value: results,
            usage: None,
            correlation_id: Uuid::new_v4().to_string(),
            latency_ms: 0,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn score_evaluation(
        &self,
        _request: &ScoreEvaluationRequest,
    ) -> AppResult<ProviderReply<HashMap<i64, LlmCategoryScore>>> {
        Ok(empty_reply(Uuid::new_v4().to_string()))
    }
}
