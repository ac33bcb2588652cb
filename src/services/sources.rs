//! Seams between the engine and its storage. Each trait has a SQLite adapter in
//! `db::repositories`.

use tracing::info;

use crate::error::AppResult;
use crate::models::audit::AuditEvent;
use crate::models::classification::{ClassifiedLog, PendingLog};
use crate::models::credential::{Credential, NewCredential};
use crate::models::evaluation::{KpiBreakdownEntry, MonthlyEvaluation};

pub trait CategorySource: Send + Sync {
    /// Live KPI category names, in display order.
    fn list_category_names(&self) -> AppResult<Vec<String>>;
}

pub trait CredentialStore: Send + Sync {
    fn list_credentials(&self) -> AppResult<Vec<Credential>>;
    fn insert_credential(&self, input: &NewCredential, encrypted_secret: &str) -> AppResult<Credential>;
    fn update_credential(&self, credential: &Credential) -> AppResult<()>;
    fn delete_credential(&self, id: i64) -> AppResult<()>;
}

pub trait TaskLogStore: Send + Sync {
    /// Logs never classified, oldest first, followed by earlier fallbacks.
    fn pending_logs(&self, limit: usize) -> AppResult<Vec<PendingLog>>;
    /// Writes back one batch atomically, overwriting earlier results.
    fn write_classifications(&self, entries: &[ClassifiedLog]) -> AppResult<()>;
}

pub trait BreakdownSource: Send + Sync {
    fn breakdown(&self, employee_id: i64, year: i32, month: u32) -> AppResult<Vec<KpiBreakdownEntry>>;
}

/// Read-modify-write step applied to the current record, if any.
pub type EvaluationUpdate<'a> =
    Box<dyn FnOnce(Option<MonthlyEvaluation>) -> AppResult<MonthlyEvaluation> + 'a>;

pub trait EvaluationStore: Send + Sync {
    fn get_evaluation(&self, employee_id: i64, year: i32, month: u32)
        -> AppResult<Option<MonthlyEvaluation>>;
    /// Inserts or replaces the record for (employee, year, month) and returns it with its id.
    fn upsert_evaluation(&self, evaluation: &MonthlyEvaluation) -> AppResult<MonthlyEvaluation>;
    /// Reads the record, applies `update` and writes the result under one write
    /// lock, so writers of different lanes never overwrite each other.
    fn modify_evaluation(
        &self,
        employee_id: i64,
        year: i32,
        month: u32,
        update: EvaluationUpdate<'_>,
    ) -> AppResult<MonthlyEvaluation>;
    /// Final scores of the given employees for the period; missing or unscored records are skipped.
    fn final_scores(&self, employee_ids: &[i64], year: i32, month: u32) -> AppResult<Vec<f64>>;
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> AppResult<()>;
}

/// Writes audit events to the `app::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> AppResult<()> {
        let details = serde_json::to_string(&event.details)?;
        info!(
            target: "app::audit",
            action = event.action.as_str(),
            employee_id = event.employee_id,
            year = event.year,
            month = event.month,
            final_score = ?event.final_score,
            actor_id = ?event.actor_id,
            occurred_at = %event.occurred_at.to_rfc3339(),
            details = %details,
            "evaluation audit event"
        );
        Ok(())
    }
}
