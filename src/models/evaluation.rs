use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::settings::{ManagerKpiWeights, ScoringWeights};
use crate::utils::score_combinator::{combine, round2, ScoreComponent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Draft,
    Pending,
    Approved,
    Published,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Draft => "draft",
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Approved => "approved",
            EvaluationStatus::Published => "published",
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(EvaluationStatus::Draft),
            "pending" => Ok(EvaluationStatus::Pending),
            "approved" => Ok(EvaluationStatus::Approved),
            "published" => Ok(EvaluationStatus::Published),
            other => Err(AppError::validation(format!("unknown evaluation status: {other}"))),
        }
    }
}

/// Per employee, per category, per month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiBreakdownEntry {
    pub category_id: i64,
    pub category_name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub logged_hours: f64,
    pub planned_hours: f64,
    pub rule_score: f64,
    #[serde(default)]
    pub llm_score: Option<f64>,
    #[serde(default)]
    pub llm_confidence: Option<f64>,
}

fn default_weight() -> f64 {
    1.0
}

/// Deterministic adherence score for one category: 100 × min(logged / planned, 1).
/// Unplanned work that was logged counts as fully adherent.
pub fn rule_sub_score(logged_hours: f64, planned_hours: f64) -> f64 {
    let logged = logged_hours.max(0.0);
    let planned = planned_hours.max(0.0);
    if planned > 0.0 {
        round2((logged / planned).min(1.0) * 100.0)
    } else if logged > 0.0 {
        100.0
    } else {
        0.0
    }
}

/// Category-weighted mean of rule sub-scores; 0 for an empty breakdown.
pub fn rule_based_score(breakdown: &[KpiBreakdownEntry]) -> f64 {
    let components: Vec<ScoreComponent> = breakdown
        .iter()
        .map(|entry| ScoreComponent::new("category", entry.weight, Some(entry.rule_score)))
        .collect();
    combine(&components).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmCategoryScore {
    pub score: f64,
    pub confidence: f64,
}

/// Mean of the model's category scores weighted by category weight × confidence.
/// `None` when the model produced nothing usable.
pub fn llm_based_score(
    breakdown: &[KpiBreakdownEntry],
    scores: &HashMap<i64, LlmCategoryScore>,
) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }

    let scored: Vec<(&KpiBreakdownEntry, &LlmCategoryScore)> = breakdown
        .iter()
        .filter_map(|entry| scores.get(&entry.category_id).map(|score| (entry, score)))
        .collect();

    let confidence_weighted: Vec<ScoreComponent> = scored
        .iter()
        .map(|(entry, score)| {
            ScoreComponent::new("category", entry.weight * score.confidence, Some(score.score))
        })
        .collect();

    combine(&confidence_weighted).or_else(|| {
        let plain: Vec<ScoreComponent> = scored
            .iter()
            .map(|(entry, score)| ScoreComponent::new("category", entry.weight, Some(score.score)))
            .collect();
        combine(&plain)
    })
}

/// Input for the model-assisted scoring call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEvaluationRequest {
    pub employee_id: i64,
    pub year: i32,
    pub month: u32,
    pub breakdown: Vec<KpiBreakdownEntry>,
}

impl ScoreEvaluationRequest {
    pub fn category_ids(&self) -> Vec<i64> {
        self.breakdown.iter().map(|entry| entry.category_id).collect()
    }
}

/// Which lanes of an evaluation are populated. Computing it has no side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreStatus {
    pub has_rule_based: bool,
    pub has_llm: bool,
    pub has_hr: bool,
    pub has_supervisor: bool,
    pub has_team_scores: bool,
    pub missing: Vec<&'static str>,
    pub ready_to_finalize: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyEvaluation {
    pub id: Option<i64>,
    pub employee_id: i64,
    pub year: i32,
    pub month: u32,
    pub is_manager: bool,
    pub breakdown: Vec<KpiBreakdownEntry>,
    pub rule_based_score: Option<f64>,
    pub llm_based_score: Option<f64>,
    pub hr_score: Option<f64>,
    pub hr_remarks: Option<String>,
    pub hr_scored_at: Option<DateTime<Utc>>,
    pub supervisor_score: Option<f64>,
    pub supervisor_remarks: Option<String>,
    pub supervisor_scored_at: Option<DateTime<Utc>>,
    pub final_score: Option<f64>,
    pub status: EvaluationStatus,
    pub finalized_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub team_member_count: Option<u32>,
    pub team_member_avg_score: Option<f64>,
    pub team_member_min_score: Option<f64>,
    pub team_member_max_score: Option<f64>,
    pub manager_productivity_score: Option<f64>,
    pub manager_supervision_effectiveness: Option<f64>,
    pub manager_kpi_score: Option<f64>,
    pub manager_kpi_weights: Option<ManagerKpiWeights>,
}

impl MonthlyEvaluation {
    pub fn new(employee_id: i64, year: i32, month: u32, is_manager: bool) -> AppResult<Self> {
        ensure_period(year, month)?;
        Ok(Self {
            id: None,
            employee_id,
            year,
            month,
            is_manager,
            breakdown: Vec::new(),
            rule_based_score: None,
            llm_based_score: None,
            hr_score: None,
            hr_remarks: None,
            hr_scored_at: None,
            supervisor_score: None,
            supervisor_remarks: None,
            supervisor_scored_at: None,
            final_score: None,
            status: EvaluationStatus::Draft,
            finalized_at: None,
            published_at: None,
            team_member_count: None,
            team_member_avg_score: None,
            team_member_min_score: None,
            team_member_max_score: None,
            manager_productivity_score: None,
            manager_supervision_effectiveness: None,
            manager_kpi_score: None,
            manager_kpi_weights: None,
        })
    }

    /// Replaces the automated lanes. Human lanes are left untouched.
    pub fn apply_automated_scores(
        &mut self,
        breakdown: Vec<KpiBreakdownEntry>,
        llm_scores: &HashMap<i64, LlmCategoryScore>,
        weights: &ScoringWeights,
    ) -> AppResult<Option<f64>> {
        self.ensure_editable()?;
        let mut breakdown = breakdown;
        for entry in breakdown.iter_mut() {
            match llm_scores.get(&entry.category_id) {
                Some(score) => {
                    entry.llm_score = Some(score.score);
                    entry.llm_confidence = Some(score.confidence);
                }
                None => {
                    entry.llm_score = None;
                    entry.llm_confidence = None;
                }
            }
        }
        self.rule_based_score = Some(rule_based_score(&breakdown));
        self.llm_based_score = llm_based_score(&breakdown, llm_scores);
        self.breakdown = breakdown;
        Ok(self.recalculate_final_score(weights))
    }

    pub fn set_hr_score(
        &mut self,
        score: f64,
        remarks: Option<String>,
        scored_at: DateTime<Utc>,
        weights: &ScoringWeights,
    ) -> AppResult<Option<f64>> {
        self.ensure_editable()?;
        ensure_score("hr_score", score)?;
        self.hr_score = Some(score);
        self.hr_remarks = normalize_remarks(remarks);
        self.hr_scored_at = Some(scored_at);
        Ok(self.recalculate_final_score(weights))
    }

    pub fn set_supervisor_score(
        &mut self,
        score: f64,
        remarks: Option<String>,
        scored_at: DateTime<Utc>,
        weights: &ScoringWeights,
    ) -> AppResult<Option<f64>> {
        self.ensure_editable()?;
        ensure_score("supervisor_score", score)?;
        self.supervisor_score = Some(score);
        self.supervisor_remarks = normalize_remarks(remarks);
        self.supervisor_scored_at = Some(scored_at);
        Ok(self.recalculate_final_score(weights))
    }

    /// Combines whichever lanes are present. Managers additionally carry the
    /// manager KPI lane.
    pub fn recalculate_final_score(&mut self, weights: &ScoringWeights) -> Option<f64> {
        let mut components = vec![
            ScoreComponent::new("rule_based", weights.rule_based, self.rule_based_score),
            ScoreComponent::new("llm", weights.llm, self.llm_based_score),
            ScoreComponent::new("hr", weights.hr, self.hr_score),
            ScoreComponent::new("supervisor", weights.supervisor, self.supervisor_score),
        ];
        if self.is_manager {
            components.push(ScoreComponent::new(
                "manager_kpi",
                weights.manager_kpi,
                self.manager_kpi_score,
            ));
        }
        self.final_score = combine(&components);
        self.final_score
    }

    /// Stores count/min/max/avg over the subordinates' final scores.
    pub fn set_team_member_scores(&mut self, scores: &[f64]) -> AppResult<()> {
        self.ensure_manager()?;
        self.ensure_editable()?;
        let valid: Vec<f64> = scores.iter().copied().filter(|value| value.is_finite()).collect();
        self.team_member_count = Some(valid.len() as u32);
        if valid.is_empty() {
            self.team_member_avg_score = None;
            self.team_member_min_score = None;
            self.team_member_max_score = None;
            return Ok(());
        }
        let sum: f64 = valid.iter().sum();
        self.team_member_avg_score = Some(round2(sum / valid.len() as f64));
        self.team_member_min_score = valid.iter().copied().reduce(f64::min);
        self.team_member_max_score = valid.iter().copied().reduce(f64::max);
        Ok(())
    }

    pub fn set_manager_productivity_score(&mut self, score: Option<f64>) -> AppResult<()> {
        self.ensure_manager()?;
        self.ensure_editable()?;
        if let Some(value) = score {
            ensure_score("manager_productivity_score", value)?;
        }
        self.manager_productivity_score = score;
        Ok(())
    }

    /// Trend against last month's team average: 50 means unchanged, each point of
    /// improvement adds one, clamped to 0..=100.
    pub fn apply_supervision_trend(&mut self, previous_team_avg: Option<f64>) -> AppResult<()> {
        self.ensure_manager()?;
        self.ensure_editable()?;
        self.manager_supervision_effectiveness =
            match (self.team_member_avg_score, previous_team_avg) {
                (Some(current), Some(previous)) => {
                    Some(round2((50.0 + (current - previous)).clamp(0.0, 100.0)))
                }
                _ => None,
            };
        Ok(())
    }

    pub fn calculate_manager_kpi(&mut self, weights: &ManagerKpiWeights) -> AppResult<Option<f64>> {
        self.ensure_manager()?;
        self.ensure_editable()?;
        self.manager_kpi_score = combine(&[
            ScoreComponent::new("team_average", weights.team_average, self.team_member_avg_score),
            ScoreComponent::new(
                "productivity",
                weights.productivity,
                self.manager_productivity_score,
            ),
            ScoreComponent::new(
                "supervision",
                weights.supervision,
                self.manager_supervision_effectiveness,
            ),
        ]);
        self.manager_kpi_weights = Some(*weights);
        Ok(self.manager_kpi_score)
    }

    pub fn score_status(&self) -> ScoreStatus {
        let has_rule_based = self.rule_based_score.is_some();
        let has_llm = self.llm_based_score.is_some();
        let has_hr = self.hr_score.is_some();
        let has_supervisor = self.supervisor_score.is_some();
        let has_team_scores = self.team_member_avg_score.is_some();

        let mut missing = Vec::new();
        if !has_hr {
            missing.push("hr_score");
        }
        if !has_supervisor {
            missing.push("supervisor_score");
        }
        if self.is_manager && !has_team_scores {
            missing.push("team_member_scores");
        }

        ScoreStatus {
            has_rule_based,
            has_llm,
            has_hr,
            has_supervisor,
            has_team_scores,
            ready_to_finalize: missing.is_empty(),
            missing,
        }
    }

    pub fn is_ready_to_finalize(&self) -> bool {
        self.score_status().ready_to_finalize
    }

    pub fn submit_for_review(&mut self) -> AppResult<()> {
        self.transition(EvaluationStatus::Draft, EvaluationStatus::Pending)
    }

    /// Pending → approved, only once every required lane is present.
    pub fn approve(&mut self, at: DateTime<Utc>) -> AppResult<()> {
        if self.status == EvaluationStatus::Pending && !self.is_ready_to_finalize() {
            let missing = self.score_status().missing.join(", ");
            return Err(AppError::validation(format!(
                "evaluation is missing required scores: {missing}"
            )));
        }
        self.transition(EvaluationStatus::Pending, EvaluationStatus::Approved)?;
        self.finalized_at = Some(at);
        Ok(())
    }

    pub fn publish(&mut self, at: DateTime<Utc>) -> AppResult<()> {
        self.transition(EvaluationStatus::Approved, EvaluationStatus::Published)?;
        self.published_at = Some(at);
        Ok(())
    }

    fn transition(&mut self, from: EvaluationStatus, to: EvaluationStatus) -> AppResult<()> {
        if self.status != from {
            return Err(AppError::invalid_transition(self.status.as_str(), to.as_str()));
        }
        self.status = to;
        Ok(())
    }

    fn ensure_editable(&self) -> AppResult<()> {
        if self.status == EvaluationStatus::Published {
            return Err(AppError::conflict("published evaluations are read-only"));
        }
        Ok(())
    }

    fn ensure_manager(&self) -> AppResult<()> {
        if !self.is_manager {
            return Err(AppError::validation(
                "team scores only apply to manager evaluations",
            ));
        }
        Ok(())
    }
}

fn ensure_period(year: i32, month: u32) -> AppResult<()> {
    if !(1..=12).contains(&month) {
        return Err(AppError::validation(format!("month out of range: {month}")));
    }
    if !(2000..=2100).contains(&year) {
        return Err(AppError::validation(format!("year out of range: {year}")));
    }
    Ok(())
}

fn ensure_score(field: &str, score: f64) -> AppResult<()> {
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(AppError::validation(format!(
            "{field} must be between 0 and 100"
        )));
    }
    Ok(())
}

fn normalize_remarks(remarks: Option<String>) -> Option<String> {
    remarks
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, weight: f64, logged: f64, planned: f64) -> KpiBreakdownEntry {
        KpiBreakdownEntry {
            category_id: id,
            category_name: format!("cat-{id}"),
            weight,
            logged_hours: logged,
            planned_hours: planned,
            rule_score: rule_sub_score(logged, planned),
            llm_score: None,
            llm_confidence: None,
        }
    }

    #[test]
    fn rule_sub_score_caps_adherence() {
        assert_eq!(rule_sub_score(30.0, 40.0), 75.0);
        assert_eq!(rule_sub_score(60.0, 40.0), 100.0);
        assert_eq!(rule_sub_score(5.0, 0.0), 100.0);
        assert_eq!(rule_sub_score(0.0, 0.0), 0.0);
    }

    #[test]
    fn rule_based_score_is_weighted_by_category() {
        let breakdown = vec![entry(1, 3.0, 40.0, 40.0), entry(2, 1.0, 20.0, 40.0)];
        // (100*3 + 50*1) / 4
        assert_eq!(rule_based_score(&breakdown), 87.5);
        assert_eq!(rule_based_score(&[]), 0.0);
    }

    #[test]
    fn three_lanes_present_excludes_supervisor_and_is_not_ready() {
        let weights = ScoringWeights::default();
        let mut evaluation = MonthlyEvaluation::new(7, 2025, 3, false).unwrap();
        evaluation.rule_based_score = Some(70.0);
        evaluation.llm_based_score = Some(75.0);
        let final_score = evaluation
            .set_hr_score(80.0, Some("solid month".into()), Utc::now(), &weights)
            .unwrap()
            .unwrap();

        assert!((final_score - 75.71).abs() < 1e-9);
        assert!(!evaluation.is_ready_to_finalize());
        assert_eq!(evaluation.score_status().missing, vec!["supervisor_score"]);
        assert!(evaluation.hr_scored_at.is_some());
    }

    #[test]
    fn supervisor_lane_triggers_recalculation() {
        let weights = ScoringWeights::default();
        let mut evaluation = MonthlyEvaluation::new(7, 2025, 3, false).unwrap();
        evaluation.rule_based_score = Some(70.0);
        evaluation.llm_based_score = Some(75.0);
        evaluation.set_hr_score(80.0, None, Utc::now(), &weights).unwrap();
        let final_score = evaluation
            .set_supervisor_score(90.0, None, Utc::now(), &weights)
            .unwrap()
            .unwrap();
        assert!((final_score - 80.0).abs() < 1e-9);
        assert!(evaluation.is_ready_to_finalize());
    }

    #[test]
    fn team_scores_produce_min_max_avg() {
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, true).unwrap();
        evaluation.set_team_member_scores(&[90.0, 70.0, 50.0]).unwrap();
        assert_eq!(evaluation.team_member_count, Some(3));
        assert_eq!(evaluation.team_member_min_score, Some(50.0));
        assert_eq!(evaluation.team_member_max_score, Some(90.0));
        assert_eq!(evaluation.team_member_avg_score, Some(70.0));
    }

    #[test]
    fn manager_kpi_tolerates_missing_components() {
        let weights = ManagerKpiWeights::default();
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, true).unwrap();
        evaluation.set_team_member_scores(&[80.0, 60.0]).unwrap();
        // Only the team lane: renormalized to the team average.
        assert_eq!(evaluation.calculate_manager_kpi(&weights).unwrap(), Some(70.0));

        evaluation.set_manager_productivity_score(Some(90.0)).unwrap();
        evaluation.apply_supervision_trend(Some(65.0)).unwrap();
        assert_eq!(evaluation.manager_supervision_effectiveness, Some(55.0));
        // 70*0.5 + 90*0.3 + 55*0.2
        assert_eq!(evaluation.calculate_manager_kpi(&weights).unwrap(), Some(73.0));
        assert_eq!(evaluation.manager_kpi_weights, Some(weights));
    }

    #[test]
    fn team_scores_rejected_for_regular_employees() {
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, false).unwrap();
        assert!(evaluation.set_team_member_scores(&[80.0]).is_err());
    }

    #[test]
    fn manager_requires_team_lane_to_finalize() {
        let weights = ScoringWeights::default();
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, true).unwrap();
        evaluation.set_hr_score(80.0, None, Utc::now(), &weights).unwrap();
        evaluation.set_supervisor_score(85.0, None, Utc::now(), &weights).unwrap();
        assert!(!evaluation.is_ready_to_finalize());
        evaluation.set_team_member_scores(&[70.0]).unwrap();
        assert!(evaluation.is_ready_to_finalize());
    }

    #[test]
    fn publish_only_from_approved() {
        let weights = ScoringWeights::default();
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, false).unwrap();
        assert!(matches!(
            evaluation.publish(Utc::now()),
            Err(AppError::InvalidTransition { .. })
        ));

        evaluation.submit_for_review().unwrap();
        assert!(evaluation.approve(Utc::now()).is_err());
        evaluation.set_hr_score(80.0, None, Utc::now(), &weights).unwrap();
        evaluation.set_supervisor_score(80.0, None, Utc::now(), &weights).unwrap();
        evaluation.approve(Utc::now()).unwrap();
        evaluation.publish(Utc::now()).unwrap();

        assert_eq!(evaluation.status, EvaluationStatus::Published);
        assert!(evaluation.published_at.is_some());
        assert!(evaluation.set_hr_score(10.0, None, Utc::now(), &weights).is_err());
    }

    #[test]
    fn llm_score_weights_by_confidence_and_ignores_unknown_ids() {
        let breakdown = vec![entry(1, 1.0, 10.0, 10.0), entry(2, 1.0, 10.0, 10.0)];
        let mut scores = HashMap::new();
        scores.insert(1, LlmCategoryScore { score: 90.0, confidence: 0.9 });
        scores.insert(2, LlmCategoryScore { score: 60.0, confidence: 0.3 });
        scores.insert(99, LlmCategoryScore { score: 0.0, confidence: 1.0 });
        // (90*0.9 + 60*0.3) / 1.2
        assert_eq!(llm_based_score(&breakdown, &scores), Some(82.5));
        assert_eq!(llm_based_score(&breakdown, &HashMap::new()), None);
    }

    #[test]
    fn out_of_range_scores_are_rejected() {
        let mut evaluation = MonthlyEvaluation::new(1, 2025, 3, false).unwrap();
        assert!(evaluation
            .set_hr_score(120.0, None, Utc::now(), &ScoringWeights::default())
            .is_err());
        assert!(MonthlyEvaluation::new(1, 2025, 13, false).is_err());
    }
}
