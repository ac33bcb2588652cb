use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::evaluation::{MonthlyEvaluation, ScoreEvaluationRequest, ScoreStatus};
use crate::models::settings::{EngineSettings, ManagerKpiWeights, ScoringWeights};
use crate::services::classification_dispatcher::ClassificationDispatcher;
use crate::services::sources::{AuditSink, BreakdownSource, EvaluationStore};

/// Orchestrates monthly evaluations: automated lanes from the breakdown and the
/// model, human lanes from HR and supervisors, and the manager roll-up.
#[derive(Clone)]
pub struct ScoringService {
    evaluations: Arc<dyn EvaluationStore>,
    breakdowns: Arc<dyn BreakdownSource>,
    dispatcher: ClassificationDispatcher,
    audit: Arc<dyn AuditSink>,
    weights: ScoringWeights,
    manager_weights: ManagerKpiWeights,
}

impl ScoringService {
    pub fn new(
        evaluations: Arc<dyn EvaluationStore>,
        breakdowns: Arc<dyn BreakdownSource>,
        dispatcher: ClassificationDispatcher,
        audit: Arc<dyn AuditSink>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            evaluations,
            breakdowns,
            dispatcher,
            audit,
            weights: settings.scoring,
            manager_weights: settings.manager_kpi,
        }
    }

    pub fn get_evaluation(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
    ) -> AppResult<Option<MonthlyEvaluation>> {
        self.evaluations.get_evaluation(employee_id, year, month)
    }

    pub fn score_status(&self, employee_id: i64, year: i32, month: u32) -> AppResult<ScoreStatus> {
        Ok(self.require(employee_id, year, month)?.score_status())
    }

    /// Recomputes the rule-based and model lanes from the current breakdown.
    /// The record is re-read after the model call, so human lanes written
    /// meanwhile are preserved.
    pub async fn build_evaluation(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        is_manager: bool,
    ) -> AppResult<MonthlyEvaluation> {
        let fresh = MonthlyEvaluation::new(employee_id, year, month, is_manager)?;

        let breakdown = self.breakdowns.breakdown(employee_id, year, month)?;
        let request = ScoreEvaluationRequest {
            employee_id,
            year,
            month,
            breakdown: breakdown.clone(),
        };
        let llm_scores = self.dispatcher.score_breakdown(&request).await;
        debug!(
            target: "app::scoring",
            employee_id,
            categories = breakdown.len(),
            llm_categories = llm_scores.len(),
            "automated lanes computed"
        );

        let weights = self.weights;
        let saved = self.evaluations.modify_evaluation(
            employee_id,
            year,
            month,
            Box::new(move |current| {
                let mut evaluation = current.unwrap_or(fresh);
                evaluation.is_manager = is_manager;
                evaluation.apply_automated_scores(breakdown, &llm_scores, &weights)?;
                Ok(evaluation)
            }),
        )?;

        info!(
            target: "app::scoring",
            employee_id,
            year,
            month,
            rule_based = ?saved.rule_based_score,
            llm = ?saved.llm_based_score,
            final_score = ?saved.final_score,
            "evaluation built"
        );
        self.emit(AuditAction::EvaluationBuilt, &saved, None, None);
        Ok(saved)
    }

    pub fn set_hr_score(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        score: f64,
        remarks: Option<String>,
        actor_id: Option<i64>,
    ) -> AppResult<MonthlyEvaluation> {
        let weights = self.weights;
        let saved = self.update_existing(employee_id, year, month, |evaluation| {
            evaluation.set_hr_score(score, remarks, Utc::now(), &weights).map(|_| ())
        })?;
        self.emit(
            AuditAction::HrScoreSet,
            &saved,
            actor_id,
            Some(json!({ "hrScore": score })),
        );
        Ok(saved)
    }

    pub fn set_supervisor_score(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        score: f64,
        remarks: Option<String>,
        actor_id: Option<i64>,
    ) -> AppResult<MonthlyEvaluation> {
        let weights = self.weights;
        let saved = self.update_existing(employee_id, year, month, |evaluation| {
            evaluation.set_supervisor_score(score, remarks, Utc::now(), &weights).map(|_| ())
        })?;
        self.emit(
            AuditAction::SupervisorScoreSet,
            &saved,
            actor_id,
            Some(json!({ "supervisorScore": score })),
        );
        Ok(saved)
    }

    /// Rolls subordinate final scores into the manager's record and recomputes
    /// the manager KPI and final score.
    pub fn refresh_team_scores(
        &self,
        manager_id: i64,
        year: i32,
        month: u32,
        subordinate_ids: &[i64],
        productivity_score: Option<f64>,
    ) -> AppResult<MonthlyEvaluation> {
        let scores = self.evaluations.final_scores(subordinate_ids, year, month)?;
        let (previous_year, previous_month) = previous_period(year, month);
        let previous_avg = self
            .evaluations
            .get_evaluation(manager_id, previous_year, previous_month)?
            .and_then(|previous| previous.team_member_avg_score);

        let weights = self.weights;
        let manager_weights = self.manager_weights;
        let saved = self.update_existing(manager_id, year, month, |evaluation| {
            if !evaluation.is_manager {
                return Err(AppError::validation(format!(
                    "employee {manager_id} is not evaluated as a manager"
                )));
            }
            evaluation.set_team_member_scores(&scores)?;
            evaluation.set_manager_productivity_score(productivity_score)?;
            evaluation.apply_supervision_trend(previous_avg)?;
            evaluation.calculate_manager_kpi(&manager_weights)?;
            evaluation.recalculate_final_score(&weights);
            Ok(())
        })?;

        info!(
            target: "app::scoring",
            manager_id,
            team_size = scores.len(),
            team_avg = ?saved.team_member_avg_score,
            manager_kpi = ?saved.manager_kpi_score,
            "team scores refreshed"
        );
        self.emit(
            AuditAction::TeamScoresRefreshed,
            &saved,
            None,
            Some(json!({
                "subordinates": subordinate_ids,
                "scored": scores.len(),
            })),
        );
        Ok(saved)
    }

    pub fn submit_for_review(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        actor_id: Option<i64>,
    ) -> AppResult<MonthlyEvaluation> {
        self.advance(employee_id, year, month, actor_id, AuditAction::Submitted, |evaluation| {
            evaluation.submit_for_review()
        })
    }

    pub fn approve(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        actor_id: Option<i64>,
    ) -> AppResult<MonthlyEvaluation> {
        self.advance(employee_id, year, month, actor_id, AuditAction::Approved, |evaluation| {
            evaluation.approve(Utc::now())
        })
    }

    pub fn publish(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        actor_id: Option<i64>,
    ) -> AppResult<MonthlyEvaluation> {
        self.advance(employee_id, year, month, actor_id, AuditAction::Published, |evaluation| {
            evaluation.publish(Utc::now())
        })
    }

    fn advance<F>(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        actor_id: Option<i64>,
        action: AuditAction,
        transition: F,
    ) -> AppResult<MonthlyEvaluation>
    where
        F: FnOnce(&mut MonthlyEvaluation) -> AppResult<()>,
    {
        let mut from = None;
        let saved = self.update_existing(employee_id, year, month, |evaluation| {
            from = Some(evaluation.status);
            transition(evaluation)
        })?;
        info!(
            target: "app::scoring",
            employee_id,
            year,
            month,
            from = ?from,
            to = %saved.status,
            "evaluation status changed"
        );
        self.emit(action, &saved, actor_id, None);
        Ok(saved)
    }

    /// Applies `apply` to the stored record under the store's write lock.
    fn update_existing<F>(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        apply: F,
    ) -> AppResult<MonthlyEvaluation>
    where
        F: FnOnce(&mut MonthlyEvaluation) -> AppResult<()>,
    {
        self.evaluations.modify_evaluation(
            employee_id,
            year,
            month,
            Box::new(move |current| {
                let mut evaluation = current.ok_or_else(AppError::not_found)?;
                apply(&mut evaluation)?;
                Ok(evaluation)
            }),
        )
    }

    fn require(&self, employee_id: i64, year: i32, month: u32) -> AppResult<MonthlyEvaluation> {
        self.evaluations
            .get_evaluation(employee_id, year, month)?
            .ok_or_else(AppError::not_found)
    }

    fn emit(
        &self,
        action: AuditAction,
        evaluation: &MonthlyEvaluation,
        actor_id: Option<i64>,
        details: Option<JsonValue>,
    ) {
        let event = AuditEvent {
            action,
            employee_id: evaluation.employee_id,
            year: evaluation.year,
            month: evaluation.month,
            final_score: evaluation.final_score,
            actor_id,
            occurred_at: Utc::now(),
            details,
        };
        if let Err(err) = self.audit.record(&event) {
            warn!(
                target: "app::scoring",
                action = action.as_str(),
                employee_id = evaluation.employee_id,
                error = %err,
                "audit event dropped"
            );
        }
    }
}

pub fn previous_period(year: i32, month: u32) -> (i32, u32) {
    if month <= 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_period_wraps_year() {
        assert_eq!(previous_period(2025, 1), (2024, 12));
        assert_eq!(previous_period(2025, 7), (2025, 6));
    }
}
