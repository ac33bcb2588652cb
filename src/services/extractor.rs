use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::models::classification::{ClassificationResult, UNCATEGORIZED};
use crate::models::evaluation::LlmCategoryScore;
use crate::services::prompt_templates::{JSON_END_MARKER, JSON_START_MARKER};

static ARRAY_OF_OBJECTS_GREEDY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[\s*\{.*\}\s*\]").expect("valid array regex"));
static ARRAY_OF_OBJECTS_LAZY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[\s*\{.*?\}\s*\]").expect("valid array regex"));
static NUMERIC_KEY_OBJECT_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\s*"\d+"\s*:"#).expect("valid object regex"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").expect("valid fence regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Markers,
    ArrayPattern,
    NumericKeyObject,
    WholeText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Padded to at least the expected count; never truncated.
    pub results: Vec<ClassificationResult>,
    pub parsed: usize,
    pub strategy: Option<ExtractionStrategy>,
}

impl Extraction {
    /// The first `expected` results, which is what callers write back.
    pub fn into_results(mut self, expected: usize) -> Vec<ClassificationResult> {
        self.results.truncate(expected);
        self.results
    }
}

/// Locates the first JSON candidate in `text` that parses, trying markers, the
/// array-of-objects shape, the numeric-key object shape (scoring only) and the
/// whole trimmed text, in that order.
pub fn locate_json(text: &str, allow_object_shape: bool) -> Option<(JsonValue, ExtractionStrategy)> {
    if let Some(inner) = between_markers(text) {
        if let Some(value) = parse_candidate(inner) {
            return Some((value, ExtractionStrategy::Markers));
        }
    }

    for pattern in [&*ARRAY_OF_OBJECTS_GREEDY, &*ARRAY_OF_OBJECTS_LAZY] {
        if let Some(found) = pattern.find(text) {
            if let Some(value) = parse_candidate(found.as_str()) {
                return Some((value, ExtractionStrategy::ArrayPattern));
            }
        }
    }

    if allow_object_shape {
        if let Some(value) = first_numeric_key_object(text) {
            return Some((value, ExtractionStrategy::NumericKeyObject));
        }
    }

    parse_candidate(text).map(|value| (value, ExtractionStrategy::WholeText))
}

fn between_markers(text: &str) -> Option<&str> {
    let start = text.find(JSON_START_MARKER)? + JSON_START_MARKER.len();
    let rest = &text[start..];
    let end = rest.find(JSON_END_MARKER)?;
    Some(&rest[..end])
}

/// Parses one JSON value from each `{"<digits>":` start and stops at the end of
/// that value, so braces in trailing prose are never consumed.
fn first_numeric_key_object(text: &str) -> Option<JsonValue> {
    NUMERIC_KEY_OBJECT_START.find_iter(text).find_map(|found| {
        serde_json::Deserializer::from_str(&text[found.start()..])
            .into_iter::<JsonValue>()
            .next()
            .and_then(Result::ok)
    })
}

fn parse_candidate(candidate: &str) -> Option<JsonValue> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unfenced = CODE_FENCE
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|inner| inner.as_str())
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced).ok()
}

/// Classification extraction. Never fails: unusable text yields `expected` sentinels.
pub fn extract_classifications(text: &str, expected: usize) -> Extraction {
    let located = locate_json(text, false);
    let (entries, strategy) = match located {
        Some((value, strategy)) => (classification_entries(value), Some(strategy)),
        None => (Vec::new(), None),
    };

    let mut results: Vec<ClassificationResult> = entries.iter().map(normalize_entry).collect();
    let parsed = results.len();
    while results.len() < expected {
        results.push(ClassificationResult::sentinel());
    }

    Extraction {
        results,
        parsed,
        strategy,
    }
}

fn classification_entries(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => {
            if map.contains_key("category") {
                return vec![JsonValue::Object(map)];
            }
            for key in ["results", "classifications", "items", "data"] {
                if let Some(JsonValue::Array(items)) = map.get(key) {
                    return items.clone();
                }
            }
            map.into_iter()
                .find_map(|(_, value)| match value {
                    JsonValue::Array(items) => Some(items),
                    _ => None,
                })
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

fn normalize_entry(entry: &JsonValue) -> ClassificationResult {
    let category = entry
        .get("category")
        .or_else(|| entry.get("label"))
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNCATEGORIZED);
    let confidence = entry.get("confidence").and_then(as_confidence).unwrap_or(0.0);
    ClassificationResult::new(category, confidence, entry.clone())
}

/// Like `as_number`, but `"85%"` reads as 0.85.
fn as_confidence(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::String(text) if text.trim().ends_with('%') => {
            as_number(value).map(|percent| percent / 100.0)
        }
        _ => as_number(value),
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(text) => text.trim().trim_end_matches('%').trim_end().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|number| number.is_finite())
}

/// Scoring extraction. Keys outside `allowed_ids` are dropped; anything
/// unparseable yields an empty map.
pub fn extract_scores(text: &str, allowed_ids: &[i64]) -> HashMap<i64, LlmCategoryScore> {
    let allowed: HashSet<i64> = allowed_ids.iter().copied().collect();
    let Some((value, _)) = locate_json(text, true) else {
        return HashMap::new();
    };

    let mut scores = HashMap::new();
    match value {
        JsonValue::Object(map) => {
            for (key, entry) in map {
                let Ok(category_id) = key.trim().parse::<i64>() else {
                    continue;
                };
                if !allowed.contains(&category_id) {
                    continue;
                }
                if let Some(score) = normalize_score(&entry) {
                    scores.insert(category_id, score);
                }
            }
        }
        JsonValue::Array(items) => {
            for entry in items {
                let Some(category_id) = entry
                    .get("category_id")
                    .or_else(|| entry.get("categoryId"))
                    .and_then(|id| match id {
                        JsonValue::Number(number) => number.as_i64(),
                        JsonValue::String(text) => text.trim().parse::<i64>().ok(),
                        _ => None,
                    })
                else {
                    continue;
                };
                if !allowed.contains(&category_id) {
                    continue;
                }
                if let Some(score) = normalize_score(&entry) {
                    scores.insert(category_id, score);
                }
            }
        }
        _ => {}
    }
    scores
}

fn normalize_score(entry: &JsonValue) -> Option<LlmCategoryScore> {
    let (score, confidence) = match entry {
        JsonValue::Object(_) => (
            entry.get("score").and_then(as_number)?,
            entry.get("confidence").and_then(as_confidence).unwrap_or(0.0),
        ),
        other => (as_number(other)?, 0.0),
    };
    Some(LlmCategoryScore {
        score: score.clamp(0.0, 100.0),
        confidence: confidence.clamp(0.0, 1.0),
    })
}
