use std::convert::TryFrom;

use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{named_params, Connection, OptionalExtension, Row};

use super::{parse_timestamp, SqliteStore};
use crate::error::{AppError, AppResult};
use crate::models::classification::{
    ClassificationResult, ClassifiedLog, PendingLog, TaskLog, UNCATEGORIZED,
};
use crate::models::evaluation::{rule_sub_score, KpiBreakdownEntry};
use crate::services::sources::{BreakdownSource, TaskLogStore};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct TaskLogRow {
    pub id: i64,
    pub employee_id: i64,
    pub work_date: String,
    pub description: String,
    pub hours: f64,
    pub category: Option<String>,
    pub confidence: Option<f64>,
    pub classified_at: Option<String>,
}

impl TryFrom<&Row<'_>> for TaskLogRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            employee_id: row.get("employee_id")?,
            work_date: row.get("work_date")?,
            description: row.get("description")?,
            hours: row.get("hours")?,
            category: row.get("category")?,
            confidence: row.get("confidence")?,
            classified_at: row.get("classified_at")?,
        })
    }
}

impl TaskLogRow {
    pub fn into_task_log(self) -> AppResult<TaskLog> {
        let work_date = NaiveDate::parse_from_str(&self.work_date, DATE_FORMAT).map_err(|err| {
            AppError::database(format!("task log {} has invalid work_date: {err}", self.id))
        })?;
        Ok(TaskLog {
            id: self.id,
            employee_id: self.employee_id,
            work_date,
            description: self.description,
            hours: self.hours,
            category: self.category,
            confidence: self.confidence,
            classified_at: parse_timestamp(self.classified_at),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub employee_id: i64,
    pub work_date: NaiveDate,
    pub description: String,
    pub hours: f64,
}

pub struct TaskLogRepository;

impl TaskLogRepository {
    pub fn insert(conn: &Connection, input: &NewTaskLog) -> AppResult<i64> {
        if input.description.trim().is_empty() {
            return Err(AppError::validation("task log description must not be empty"));
        }
        conn.execute(
            r#"
                INSERT INTO task_logs (employee_id, work_date, description, hours)
                VALUES (:employee_id, :work_date, :description, :hours)
            "#,
            named_params! {
                ":employee_id": input.employee_id,
                ":work_date": input.work_date.format(DATE_FORMAT).to_string(),
                ":description": input.description.trim(),
                ":hours": input.hours,
            },
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find(conn: &Connection, id: i64) -> AppResult<Option<TaskLog>> {
        conn.query_row(
            r#"
                SELECT id, employee_id, work_date, description, hours, category, confidence, classified_at
                FROM task_logs WHERE id = ?1
            "#,
            [id],
            |row| TaskLogRow::try_from(row),
        )
        .optional()?
        .map(TaskLogRow::into_task_log)
        .transpose()
    }

    /// Unclassified logs first, then logs that fell back to `Uncategorized`
    /// with confidence 0 so they are retried once a provider answers again.
    pub fn pending(conn: &Connection, limit: usize) -> AppResult<Vec<PendingLog>> {
        let mut stmt = conn.prepare(
            r#"
                SELECT id, description FROM task_logs
                WHERE classified_at IS NULL
                   OR (category = :sentinel AND confidence = 0)
                ORDER BY classified_at IS NOT NULL, work_date ASC, id ASC
                LIMIT :limit
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(named_params! {":sentinel": UNCATEGORIZED, ":limit": limit}, |row| {
                Ok(PendingLog {
                    id: row.get("id")?,
                    description: row.get("description")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Overwrites any previous classification of the log.
    pub fn write_classification(
        conn: &Connection,
        id: i64,
        result: &ClassificationResult,
    ) -> AppResult<()> {
        let affected = conn.execute(
            r#"
                UPDATE task_logs SET
                    category = :category,
                    confidence = :confidence,
                    classified_at = :classified_at
                WHERE id = :id
            "#,
            named_params! {
                ":id": id,
                ":category": result.category,
                ":confidence": result.confidence,
                ":classified_at": Utc::now().to_rfc3339(),
            },
        )?;
        if affected == 0 {
            return Err(AppError::not_found());
        }
        Ok(())
    }

    /// Writes a whole batch. Callers wrap it in a transaction.
    pub fn write_classifications(conn: &Connection, entries: &[ClassifiedLog]) -> AppResult<()> {
        for entry in entries {
            Self::write_classification(conn, entry.log_id, &entry.result)?;
        }
        Ok(())
    }

    /// Per-category logged and planned hours for one employee and month. Categories
    /// with neither are omitted.
    pub fn breakdown(
        conn: &Connection,
        employee_id: i64,
        year: i32,
        month: u32,
    ) -> AppResult<Vec<KpiBreakdownEntry>> {
        let (start, end) = month_bounds(year, month)?;
        let mut stmt = conn.prepare(
            r#"
                SELECT
                    c.id AS category_id,
                    c.name AS category_name,
                    c.weight AS weight,
                    COALESCE((
                        SELECT SUM(t.hours) FROM task_logs t
                        WHERE t.employee_id = :employee_id
                          AND t.category = c.name COLLATE NOCASE
                          AND t.work_date >= :start
                          AND t.work_date < :end
                    ), 0) AS logged_hours,
                    COALESCE((
                        SELECT p.planned_hours FROM kpi_plans p
                        WHERE p.employee_id = :employee_id
                          AND p.category_id = c.id
                          AND p.year = :year
                          AND p.month = :month
                    ), 0) AS planned_hours
                FROM kpi_categories c
                WHERE c.is_active = 1
                ORDER BY c.sort_order ASC, c.id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(
                named_params! {
                    ":employee_id": employee_id,
                    ":start": start,
                    ":end": end,
                    ":year": year,
                    ":month": month,
                },
                |row| {
                    let logged_hours: f64 = row.get("logged_hours")?;
                    let planned_hours: f64 = row.get("planned_hours")?;
                    Ok(KpiBreakdownEntry {
                        category_id: row.get("category_id")?,
                        category_name: row.get("category_name")?,
                        weight: row.get("weight")?,
                        logged_hours,
                        planned_hours,
                        rule_score: rule_sub_score(logged_hours, planned_hours),
                        llm_score: None,
                        llm_confidence: None,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|entry| entry.logged_hours > 0.0 || entry.planned_hours > 0.0)
            .collect())
    }
}

fn month_bounds(year: i32, month: u32) -> AppResult<(String, String)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| AppError::validation(format!("invalid period {year}-{month}")))?;
    let end = if start.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| AppError::validation(format!("invalid period {year}-{month}")))?;
    Ok((
        start.format(DATE_FORMAT).to_string(),
        end.format(DATE_FORMAT).to_string(),
    ))
}

impl TaskLogStore for SqliteStore {
    fn pending_logs(&self, limit: usize) -> AppResult<Vec<PendingLog>> {
        self.pool()
            .with_connection(|conn| TaskLogRepository::pending(conn, limit))
    }

    fn write_classifications(&self, entries: &[ClassifiedLog]) -> AppResult<()> {
        self.pool()
            .with_transaction(|conn| TaskLogRepository::write_classifications(conn, entries))
    }
}

impl BreakdownSource for SqliteStore {
    fn breakdown(&self, employee_id: i64, year: i32, month: u32) -> AppResult<Vec<KpiBreakdownEntry>> {
        self.pool()
            .with_connection(|conn| TaskLogRepository::breakdown(conn, employee_id, year, month))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::category_repository::CategoryRepository;
    use crate::db::DbPool;
    use serde_json::json;
    use tempfile::tempdir;

    fn log(employee_id: i64, date: &str, description: &str, hours: f64) -> NewTaskLog {
        NewTaskLog {
            employee_id,
            work_date: NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap(),
            description: description.into(),
            hours,
        }
    }

    #[test]
    fn classified_logs_leave_the_pending_queue() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());
        let (first, second) = store
            .pool()
            .with_connection(|conn| {
                Ok((
                    TaskLogRepository::insert(conn, &log(1, "2025-03-02", "Code review", 2.0))?,
                    TaskLogRepository::insert(conn, &log(1, "2025-03-01", "Sales call", 1.0))?,
                ))
            })
            .unwrap();

        let pending = store.pending_logs(10).unwrap();
        assert_eq!(pending.iter().map(|log| log.id).collect::<Vec<_>>(), vec![second, first]);

        let entry = ClassifiedLog {
            log_id: first,
            result: ClassificationResult::new("Engineering", 0.9, json!(null)),
            credential_id: Some(1),
        };
        store.write_classifications(&[entry.clone()]).unwrap();
        store.write_classifications(&[entry]).unwrap();

        assert_eq!(store.pending_logs(10).unwrap().len(), 1);
        let stored = store
            .pool()
            .with_connection(|conn| TaskLogRepository::find(conn, first))
            .unwrap()
            .unwrap();
        assert_eq!(stored.category.as_deref(), Some("Engineering"));
        assert_eq!(stored.confidence, Some(0.9));
        assert!(stored.classified_at.is_some());
    }

    #[test]
    fn sentinel_rows_are_retried_after_fresh_logs() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());
        let (fallback, classified, fresh) = store
            .pool()
            .with_connection(|conn| {
                Ok((
                    TaskLogRepository::insert(conn, &log(1, "2025-03-01", "Outage day", 2.0))?,
                    TaskLogRepository::insert(conn, &log(1, "2025-03-02", "Code review", 2.0))?,
                    TaskLogRepository::insert(conn, &log(1, "2025-03-03", "Sales call", 1.0))?,
                ))
            })
            .unwrap();

        store
            .write_classifications(&[
                ClassifiedLog {
                    log_id: fallback,
                    result: ClassificationResult::sentinel(),
                    credential_id: None,
                },
                ClassifiedLog {
                    log_id: classified,
                    result: ClassificationResult::new("Engineering", 0.8, json!(null)),
                    credential_id: Some(1),
                },
            ])
            .unwrap();

        let pending = store.pending_logs(10).unwrap();
        assert_eq!(
            pending.iter().map(|log| log.id).collect::<Vec<_>>(),
            vec![fresh, fallback]
        );
    }

    #[test]
    fn batch_write_back_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());
        let id = store
            .pool()
            .with_connection(|conn| TaskLogRepository::insert(conn, &log(1, "2025-03-01", "Deploy", 1.0)))
            .unwrap();

        let result = store.write_classifications(&[
            ClassifiedLog {
                log_id: id,
                result: ClassificationResult::new("Engineering", 0.9, json!(null)),
                credential_id: Some(1),
            },
            ClassifiedLog {
                log_id: id + 100,
                result: ClassificationResult::new("Engineering", 0.9, json!(null)),
                credential_id: Some(1),
            },
        ]);

        assert!(matches!(result, Err(AppError::NotFound)));
        let stored = store
            .pool()
            .with_connection(|conn| TaskLogRepository::find(conn, id))
            .unwrap()
            .unwrap();
        assert!(stored.classified_at.is_none());
    }

    #[test]
    fn breakdown_sums_hours_within_the_month() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());
        store
            .pool()
            .with_connection(|conn| {
                let engineering = CategoryRepository::insert(conn, "Engineering", 2.0, 0)?;
                let sales = CategoryRepository::insert(conn, "Sales", 1.0, 1)?;
                CategoryRepository::insert(conn, "Support", 1.0, 2)?;
                CategoryRepository::set_plan(conn, 7, engineering, 2025, 3, 40.0)?;
                CategoryRepository::set_plan(conn, 7, sales, 2025, 3, 10.0)?;

                let ids = [
                    TaskLogRepository::insert(conn, &log(7, "2025-03-03", "API work", 20.0))?,
                    TaskLogRepository::insert(conn, &log(7, "2025-03-31", "More API work", 10.0))?,
                    TaskLogRepository::insert(conn, &log(7, "2025-04-01", "April work", 8.0))?,
                    TaskLogRepository::insert(conn, &log(8, "2025-03-03", "Other person", 8.0))?,
                ];
                for id in ids {
                    TaskLogRepository::write_classification(
                        conn,
                        id,
                        &ClassificationResult::new("engineering", 0.9, json!(null)),
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let breakdown = store.breakdown(7, 2025, 3).unwrap();

        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].category_name, "Engineering");
        assert_eq!(breakdown[0].weight, 2.0);
        assert_eq!(breakdown[0].logged_hours, 30.0);
        assert_eq!(breakdown[0].rule_score, 75.0);
        assert_eq!(breakdown[1].category_name, "Sales");
        assert_eq!(breakdown[1].rule_score, 0.0);
    }

    #[test]
    fn december_bounds_roll_into_next_year() {
        assert_eq!(
            month_bounds(2025, 12).unwrap(),
            ("2025-12-01".to_string(), "2026-01-01".to_string())
        );
    }
}
