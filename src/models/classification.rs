use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const UNCATEGORIZED: &str = "Uncategorized";

/// One provider request: descriptions in order plus the taxonomy read at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationBatch {
    pub descriptions: Vec<String>,
    pub categories: Vec<String>,
}

impl ClassificationBatch {
    pub fn new(descriptions: Vec<String>, categories: Vec<String>) -> Self {
        Self {
            descriptions,
            categories,
        }
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub category: String,
    pub confidence: f64,
    /// Provider payload for this entry; kept for audit/debugging only.
    #[serde(default)]
    pub raw: JsonValue,
}

impl ClassificationResult {
    pub fn new(category: impl Into<String>, confidence: f64, raw: JsonValue) -> Self {
        Self {
            category: category.into(),
            confidence: confidence.clamp(0.0, 1.0),
            raw,
        }
    }

    pub fn sentinel() -> Self {
        Self {
            category: UNCATEGORIZED.to_string(),
            confidence: 0.0,
            raw: JsonValue::Null,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.category == UNCATEGORIZED
    }
}

/// Token counters reported by a provider response, when any were found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// What a provider call hands back to the dispatcher.
#[derive(Debug, Clone)]
pub struct ProviderReply<T> {
    pub value: T,
    /// Entries genuinely parsed from the response, before padding.
    pub parsed: usize,
    pub usage: Option<TokenUsage>,
    pub correlation_id: String,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub id: i64,
    pub employee_id: i64,
    pub work_date: NaiveDate,
    pub description: String,
    pub hours: f64,
    pub category: Option<String>,
    pub confidence: Option<f64>,
    pub classified_at: Option<DateTime<Utc>>,
}

/// The slice of a task log the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLog {
    pub id: i64,
    pub description: String,
}

impl From<&TaskLog> for PendingLog {
    fn from(log: &TaskLog) -> Self {
        Self {
            id: log.id,
            description: log.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedLog {
    pub log_id: i64,
    pub result: ClassificationResult,
    pub credential_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationReport {
    pub batches: usize,
    pub classified: usize,
    pub fallback: usize,
    pub results: Vec<ClassifiedLog>,
    pub fatal_errors: Vec<String>,
}

impl ClassificationReport {
    pub fn result_for(&self, log_id: i64) -> Option<&ClassificationResult> {
        self.results
            .iter()
            .find(|entry| entry.log_id == log_id)
            .map(|entry| &entry.result)
    }
}
