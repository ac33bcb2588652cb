use std::convert::TryFrom;

use rusqlite::{named_params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, SqliteStore};
use crate::error::{AppError, AppResult};
use crate::models::evaluation::{KpiBreakdownEntry, MonthlyEvaluation};
use crate::models::settings::ManagerKpiWeights;
use crate::services::sources::{EvaluationStore, EvaluationUpdate};

const SELECT_COLUMNS: &str = r#"
    id, employee_id, year, month, is_manager, breakdown_json,
    rule_based_score, llm_based_score,
    hr_score, hr_remarks, hr_scored_at,
    supervisor_score, supervisor_remarks, supervisor_scored_at,
    final_score, status, finalized_at, published_at,
    team_member_count, team_member_avg_score, team_member_min_score, team_member_max_score,
    manager_productivity_score, manager_supervision_effectiveness, manager_kpi_score,
    manager_kpi_weights
"#;

#[derive(Debug, Clone)]
pub struct EvaluationRow {
    pub id: i64,
    pub employee_id: i64,
    pub year: i32,
    pub month: u32,
    pub is_manager: bool,
    pub breakdown_json: String,
    pub rule_based_score: Option<f64>,
    pub llm_based_score: Option<f64>,
    pub hr_score: Option<f64>,
    pub hr_remarks: Option<String>,
    pub hr_scored_at: Option<String>,
    pub supervisor_score: Option<f64>,
    pub supervisor_remarks: Option<String>,
    pub supervisor_scored_at: Option<String>,
    pub final_score: Option<f64>,
    pub status: String,
    pub finalized_at: Option<String>,
    pub published_at: Option<String>,
    pub team_member_count: Option<u32>,
    pub team_member_avg_score: Option<f64>,
    pub team_member_min_score: Option<f64>,
    pub team_member_max_score: Option<f64>,
    pub manager_productivity_score: Option<f64>,
    pub manager_supervision_effectiveness: Option<f64>,
    pub manager_kpi_score: Option<f64>,
    pub manager_kpi_weights: Option<String>,
}

impl TryFrom<&Row<'_>> for EvaluationRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            employee_id: row.get("employee_id")?,
            year: row.get("year")?,
            month: row.get("month")?,
            is_manager: row.get::<_, i64>("is_manager")? != 0,
            breakdown_json: row.get("breakdown_json")?,
            rule_based_score: row.get("rule_based_score")?,
            llm_based_score: row.get("llm_based_score")?,
            hr_score: row.get("hr_score")?,
            hr_remarks: row.get("hr_remarks")?,
            hr_scored_at: row.get("hr_scored_at")?,
            supervisor_score: row.get("supervisor_score")?,
            supervisor_remarks: row.get("supervisor_remarks")?,
            supervisor_scored_at: row.get("supervisor_scored_at")?,
            final_score: row.get("final_score")?,
            status: row.get("status")?,
            finalized_at: row.get("finalized_at")?,
            published_at: row.get("published_at")?,
            team_member_count: row.get("team_member_count")?,
            team_member_avg_score: row.get("team_member_avg_score")?,
            team_member_min_score: row.get("team_member_min_score")?,
            team_member_max_score: row.get("team_member_max_score")?,
            manager_productivity_score: row.get("manager_productivity_score")?,
            manager_supervision_effectiveness: row.get("manager_supervision_effectiveness")?,
            manager_kpi_score: row.get("manager_kpi_score")?,
            manager_kpi_weights: row.get("manager_kpi_weights")?,
        })
    }
}

impl EvaluationRow {
    pub fn into_evaluation(self) -> AppResult<MonthlyEvaluation> {
        let breakdown: Vec<KpiBreakdownEntry> = serde_json::from_str(&self.breakdown_json)?;
        let manager_kpi_weights: Option<ManagerKpiWeights> = self
            .manager_kpi_weights
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(MonthlyEvaluation {
            id: Some(self.id),
            employee_id: self.employee_id,
            year: self.year,
            month: self.month,
            is_manager: self.is_manager,
            breakdown,
            rule_based_score: self.rule_based_score,
            llm_based_score: self.llm_based_score,
            hr_score: self.hr_score,
            hr_remarks: self.hr_remarks,
            hr_scored_at: parse_timestamp(self.hr_scored_at),
            supervisor_score: self.supervisor_score,
            supervisor_remarks: self.supervisor_remarks,
            supervisor_scored_at: parse_timestamp(self.supervisor_scored_at),
            final_score: self.final_score,
            status: self.status.parse()?,
            finalized_at: parse_timestamp(self.finalized_at),
            published_at: parse_timestamp(self.published_at),
            team_member_count: self.team_member_count,
            team_member_avg_score: self.team_member_avg_score,
            team_member_min_score: self.team_member_min_score,
            team_member_max_score: self.team_member_max_score,
            manager_productivity_score: self.manager_productivity_score,
            manager_supervision_effectiveness: self.manager_supervision_effectiveness,
            manager_kpi_score: self.manager_kpi_score,
            manager_kpi_weights,
        })
    }
}

pub struct EvaluationRepository;

impl EvaluationRepository {
    pub fn find(
        conn: &Connection,
        employee_id: i64,
        year: i32,
        month: u32,
    ) -> AppResult<Option<MonthlyEvaluation>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM monthly_evaluations \
             WHERE employee_id = :employee_id AND year = :year AND month = :month"
        );
        conn.query_row(
            &sql,
            named_params! {":employee_id": employee_id, ":year": year, ":month": month},
            |row| EvaluationRow::try_from(row),
        )
        .optional()?
        .map(EvaluationRow::into_evaluation)
        .transpose()
    }

    /// One record per (employee, year, month); a second write replaces the first.
    pub fn upsert(conn: &Connection, evaluation: &MonthlyEvaluation) -> AppResult<MonthlyEvaluation> {
        let breakdown_json = serde_json::to_string(&evaluation.breakdown)?;
        let manager_kpi_weights = evaluation
            .manager_kpi_weights
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
                INSERT INTO monthly_evaluations (
                    employee_id, year, month, is_manager, breakdown_json,
                    rule_based_score, llm_based_score,
                    hr_score, hr_remarks, hr_scored_at,
                    supervisor_score, supervisor_remarks, supervisor_scored_at,
                    final_score, status, finalized_at, published_at,
                    team_member_count, team_member_avg_score, team_member_min_score, team_member_max_score,
                    manager_productivity_score, manager_supervision_effectiveness, manager_kpi_score,
                    manager_kpi_weights
                ) VALUES (
                    :employee_id, :year, :month, :is_manager, :breakdown_json,
                    :rule_based_score, :llm_based_score,
                    :hr_score, :hr_remarks, :hr_scored_at,
                    :supervisor_score, :supervisor_remarks, :supervisor_scored_at,
                    :final_score, :status, :finalized_at, :published_at,
                    :team_member_count, :team_member_avg_score, :team_member_min_score, :team_member_max_score,
                    :manager_productivity_score, :manager_supervision_effectiveness, :manager_kpi_score,
                    :manager_kpi_weights
                )
                ON CONFLICT(employee_id, year, month) DO UPDATE SET
                    is_manager = excluded.is_manager,
                    breakdown_json = excluded.breakdown_json,
                    rule_based_score = excluded.rule_based_score,
                    llm_based_score = excluded.llm_based_score,
                    hr_score = excluded.hr_score,
                    hr_remarks = excluded.hr_remarks,
                    hr_scored_at = excluded.hr_scored_at,
                    supervisor_score = excluded.supervisor_score,
                    supervisor_remarks = excluded.supervisor_remarks,
                    supervisor_scored_at = excluded.supervisor_scored_at,
                    final_score = excluded.final_score,
                    status = excluded.status,
                    finalized_at = excluded.finalized_at,
                    published_at = excluded.published_at,
                    team_member_count = excluded.team_member_count,
                    team_member_avg_score = excluded.team_member_avg_score,
                    team_member_min_score = excluded.team_member_min_score,
                    team_member_max_score = excluded.team_member_max_score,
                    manager_productivity_score = excluded.manager_productivity_score,
                    manager_supervision_effectiveness = excluded.manager_supervision_effectiveness,
                    manager_kpi_score = excluded.manager_kpi_score,
                    manager_kpi_weights = excluded.manager_kpi_weights,
                    updated_at = CURRENT_TIMESTAMP
            "#,
            named_params! {
                ":employee_id": evaluation.employee_id,
                ":year": evaluation.year,
                ":month": evaluation.month,
                ":is_manager": evaluation.is_manager,
                ":breakdown_json": breakdown_json,
                ":rule_based_score": evaluation.rule_based_score,
                ":llm_based_score": evaluation.llm_based_score,
                ":hr_score": evaluation.hr_score,
                ":hr_remarks": evaluation.hr_remarks,
                ":hr_scored_at": format_timestamp(evaluation.hr_scored_at),
                ":supervisor_score": evaluation.supervisor_score,
                ":supervisor_remarks": evaluation.supervisor_remarks,
                ":supervisor_scored_at": format_timestamp(evaluation.supervisor_scored_at),
                ":final_score": evaluation.final_score,
                ":status": evaluation.status.as_str(),
                ":finalized_at": format_timestamp(evaluation.finalized_at),
                ":published_at": format_timestamp(evaluation.published_at),
                ":team_member_count": evaluation.team_member_count,
                ":team_member_avg_score": evaluation.team_member_avg_score,
                ":team_member_min_score": evaluation.team_member_min_score,
                ":team_member_max_score": evaluation.team_member_max_score,
                ":manager_productivity_score": evaluation.manager_productivity_score,
                ":manager_supervision_effectiveness": evaluation.manager_supervision_effectiveness,
                ":manager_kpi_score": evaluation.manager_kpi_score,
                ":manager_kpi_weights": manager_kpi_weights,
            },
        )?;

        Self::find(conn, evaluation.employee_id, evaluation.year, evaluation.month)?
            .ok_or_else(AppError::not_found)
    }

    pub fn final_scores(
        conn: &Connection,
        employee_ids: &[i64],
        year: i32,
        month: u32,
    ) -> AppResult<Vec<f64>> {
        let mut stmt = conn.prepare(
            r#"
                SELECT final_score FROM monthly_evaluations
                WHERE employee_id = :employee_id AND year = :year AND month = :month
                  AND final_score IS NOT NULL
            "#,
        )?;

        let mut scores = Vec::with_capacity(employee_ids.len());
        for employee_id in employee_ids {
            let score: Option<f64> = stmt
                .query_row(
                    named_params! {":employee_id": employee_id, ":year": year, ":month": month},
                    |row| row.get(0),
                )
                .optional()?;
            scores.extend(score);
        }
        Ok(scores)
    }
}

impl EvaluationStore for SqliteStore {
    fn get_evaluation(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
    ) -> AppResult<Option<MonthlyEvaluation>> {
        self.pool()
            .with_connection(|conn| EvaluationRepository::find(conn, employee_id, year, month))
    }

    fn upsert_evaluation(&self, evaluation: &MonthlyEvaluation) -> AppResult<MonthlyEvaluation> {
        self.pool()
            .with_transaction(|conn| EvaluationRepository::upsert(conn, evaluation))
    }

    fn modify_evaluation(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        update: EvaluationUpdate<'_>,
    ) -> AppResult<MonthlyEvaluation> {
        self.pool().with_immediate_transaction(|conn| {
            let current = EvaluationRepository::find(conn, employee_id, year, month)?;
            let updated = update(current)?;
            EvaluationRepository::upsert(conn, &updated)
        })
    }

    fn final_scores(&self, employee_ids: &[i64], year: i32, month: u32) -> AppResult<Vec<f64>> {
        self.pool()
            .with_connection(|conn| EvaluationRepository::final_scores(conn, employee_ids, year, month))
    }
}
