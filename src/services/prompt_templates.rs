use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::models::classification::{ClassificationBatch, UNCATEGORIZED};
use crate::models::evaluation::ScoreEvaluationRequest;

pub const JSON_START_MARKER: &str = "<<<JSON_START>>>";
pub const JSON_END_MARKER: &str = "<<<JSON_END>>>";

const FEW_SHOT_CATEGORIES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Provider-neutral prompt. Chat backends send the messages as-is; raw prompt
/// backends send the flattened transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn to_chat_messages(&self) -> JsonValue {
        serde_json::to_value(&self.messages).unwrap_or_else(|_| json!([]))
    }

    pub fn to_transcript(&self) -> String {
        let mut transcript = String::new();
        for message in &self.messages {
            let label = match message.role {
                PromptRole::System => "### Instructions",
                PromptRole::User => "### Input",
                PromptRole::Assistant => "### Response",
            };
            transcript.push_str(label);
            transcript.push('\n');
            transcript.push_str(message.content.trim_end());
            transcript.push_str("\n\n");
        }
        transcript.push_str("### Response\n");
        transcript
    }

    /// Number of worked example exchanges included before the real request.
    pub fn few_shot_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.role == PromptRole::Assistant)
            .count()
    }
}

pub fn wrap_in_markers(payload: &str) -> String {
    format!("{JSON_START_MARKER}{payload}{JSON_END_MARKER}")
}

pub fn classification_system_prompt(categories: &[String]) -> String {
    let listing = categories
        .iter()
        .enumerate()
        .map(|(index, name)| format!("{}. {}", index + 1, name))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You classify employee work-log entries into KPI categories.
Allowed categories:
{listing}

For every task log, choose exactly one allowed category, or "{UNCATEGORIZED}" when none fits.
Answer only with a JSON array of objects shaped {{"category": string, "confidence": number between 0 and 1}},
one object per task log, in the same order as the input.
Write the array between {JSON_START_MARKER} and {JSON_END_MARKER} and write nothing else."#
    )
}

fn format_task_lines(descriptions: &[String]) -> String {
    let lines = descriptions
        .iter()
        .enumerate()
        .map(|(index, description)| format!("{}. {}", index + 1, single_line(description)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Classify these {} task logs:\n{}",
        descriptions.len(),
        lines
    )
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic classification prompt: system instructions, 1–3 worked examples
/// built from the first live categories, then the real batch.
pub fn build_classification_prompt(batch: &ClassificationBatch) -> Prompt {
    let mut messages = vec![PromptMessage::new(
        PromptRole::System,
        classification_system_prompt(&batch.categories),
    )];

    let anchors: Vec<&String> = batch.categories.iter().take(FEW_SHOT_CATEGORIES).collect();
    for category in &anchors {
        let example = vec![format!("Worked on {category} deliverables for the weekly plan")];
        let answer = json!([{ "category": category, "confidence": 0.9 }]);
        messages.push(PromptMessage::new(PromptRole::User, format_task_lines(&example)));
        messages.push(PromptMessage::new(
            PromptRole::Assistant,
            wrap_in_markers(&answer.to_string()),
        ));
    }

    if anchors.len() == FEW_SHOT_CATEGORIES {
        let examples = vec![
            format!("Follow-up meeting about {} priorities", anchors[1]),
            "Lunch break".to_string(),
            format!("Reviewed open {} items with the team", anchors[0]),
        ];
        let answer = json!([
            { "category": anchors[1], "confidence": 0.8 },
            { "category": UNCATEGORIZED, "confidence": 0.2 },
            { "category": anchors[0], "confidence": 0.85 }
        ]);
        messages.push(PromptMessage::new(PromptRole::User, format_task_lines(&examples)));
        messages.push(PromptMessage::new(
            PromptRole::Assistant,
            wrap_in_markers(&answer.to_string()),
        ));
    }

    messages.push(PromptMessage::new(
        PromptRole::User,
        format_task_lines(&batch.descriptions),
    ));

    Prompt { messages }
}

pub fn scoring_system_prompt() -> String {
    format!(
        r#"You review an employee's monthly KPI breakdown. Each category lists logged hours,
planned hours and a rule-based score between 0 and 100.
Return an adjusted score for each category as a JSON object keyed by the category id:
{{"<category_id>": {{"score": number between 0 and 100, "confidence": number between 0 and 1}}}}.
Only use category ids from the input.
Write the object between {JSON_START_MARKER} and {JSON_END_MARKER} and write nothing else."#
    )
}

fn breakdown_payload(request: &ScoreEvaluationRequest) -> JsonValue {
    let categories: Vec<JsonValue> = request
        .breakdown
        .iter()
        .map(|entry| {
            json!({
                "category_id": entry.category_id,
                "category_name": entry.category_name,
                "logged_hours": entry.logged_hours,
                "planned_hours": entry.planned_hours,
                "rule_score": entry.rule_score,
            })
        })
        .collect();

    json!({
        "employee_id": request.employee_id,
        "period": format!("{:04}-{:02}", request.year, request.month),
        "categories": categories,
    })
}

pub fn build_scoring_prompt(request: &ScoreEvaluationRequest) -> Prompt {
    let mut messages = vec![PromptMessage::new(PromptRole::System, scoring_system_prompt())];

    if let Some(anchor) = request.breakdown.first() {
        let example = json!({
            "employee_id": 0,
            "period": "2000-01",
            "categories": [{
                "category_id": anchor.category_id,
                "category_name": anchor.category_name,
                "logged_hours": 30.0,
                "planned_hours": 40.0,
                "rule_score": 75.0,
            }],
        });
        let mut answer = serde_json::Map::new();
        answer.insert(
            anchor.category_id.to_string(),
            json!({ "score": 78.0, "confidence": 0.7 }),
        );
        messages.push(PromptMessage::new(PromptRole::User, example.to_string()));
        messages.push(PromptMessage::new(
            PromptRole::Assistant,
            wrap_in_markers(&JsonValue::Object(answer).to_string()),
        ));
    }

    messages.push(PromptMessage::new(
        PromptRole::User,
        breakdown_payload(request).to_string(),
    ));

    Prompt { messages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::evaluation::KpiBreakdownEntry;

    fn batch(categories: &[&str]) -> ClassificationBatch {
        ClassificationBatch::new(
            vec!["Fixed production bug causing 500 errors".to_string()],
            categories.iter().map(|name| name.to_string()).collect(),
        )
    }

    #[test]
    fn classification_prompt_lists_categories_and_markers() {
        let prompt = build_classification_prompt(&batch(&["Engineering", "Sales"]));
        let system = &prompt.messages[0].content;
        assert!(system.contains("1. Engineering"));
        assert!(system.contains("2. Sales"));
        assert!(system.contains(JSON_START_MARKER));
        assert!(system.contains(JSON_END_MARKER));

        let last = prompt.messages.last().unwrap();
        assert_eq!(last.role, PromptRole::User);
        assert!(last.content.contains("1. Fixed production bug causing 500 errors"));
    }

    #[test]
    fn few_shot_count_follows_available_categories() {
        assert_eq!(build_classification_prompt(&batch(&["Engineering"])).few_shot_count(), 1);
        assert_eq!(
            build_classification_prompt(&batch(&["Engineering", "Sales", "Support"]))
                .few_shot_count(),
            3
        );
    }

    #[test]
    fn prompt_is_deterministic() {
        let first = build_classification_prompt(&batch(&["Engineering", "Sales"]));
        let second = build_classification_prompt(&batch(&["Engineering", "Sales"]));
        assert_eq!(first, second);
    }

    #[test]
    fn transcript_ends_with_response_cue() {
        let transcript = build_classification_prompt(&batch(&["Engineering"])).to_transcript();
        assert!(transcript.starts_with("### Instructions"));
        assert!(transcript.ends_with("### Response\n"));
    }

    #[test]
    fn scoring_prompt_carries_breakdown() {
        let request = ScoreEvaluationRequest {
            employee_id: 4,
            year: 2025,
            month: 3,
            breakdown: vec![KpiBreakdownEntry {
                category_id: 12,
                category_name: "Engineering".into(),
                weight: 1.0,
                logged_hours: 38.0,
                planned_hours: 40.0,
                rule_score: 95.0,
                llm_score: None,
                llm_confidence: None,
            }],
        };
        let prompt = build_scoring_prompt(&request);
        assert_eq!(prompt.few_shot_count(), 1);
        let payload: JsonValue =
            serde_json::from_str(&prompt.messages.last().unwrap().content).unwrap();
        assert_eq!(payload["period"], "2025-03");
        assert_eq!(payload["categories"][0]["category_id"], 12);
    }
}
