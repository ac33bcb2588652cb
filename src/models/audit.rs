use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EvaluationBuilt,
    HrScoreSet,
    SupervisorScoreSet,
    TeamScoresRefreshed,
    Submitted,
    Approved,
    Published,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::EvaluationBuilt => "evaluation_built",
            AuditAction::HrScoreSet => "hr_score_set",
            AuditAction::SupervisorScoreSet => "supervisor_score_set",
            AuditAction::TeamScoresRefreshed => "team_scores_refreshed",
            AuditAction::Submitted => "submitted",
            AuditAction::Approved => "approved",
            AuditAction::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: AuditAction,
    pub employee_id: i64,
    pub year: i32,
    pub month: u32,
    pub final_score: Option<f64>,
    pub actor_id: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}
