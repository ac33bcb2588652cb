use std::convert::TryFrom;

use rusqlite::{named_params, Connection, Row};

use super::SqliteStore;
use crate::error::{AppError, AppResult};
use crate::services::sources::CategorySource;

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRow {
    pub id: i64,
    pub name: String,
    pub weight: f64,
    pub sort_order: i32,
    pub is_active: bool,
}

impl TryFrom<&Row<'_>> for CategoryRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            weight: row.get("weight")?,
            sort_order: row.get("sort_order")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
        })
    }
}

pub struct CategoryRepository;

impl CategoryRepository {
    pub fn list_active(conn: &Connection) -> AppResult<Vec<CategoryRow>> {
        let mut stmt = conn.prepare(
            r#"
                SELECT id, name, weight, sort_order, is_active
                FROM kpi_categories
                WHERE is_active = 1
                ORDER BY sort_order ASC, id ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| CategoryRow::try_from(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert(conn: &Connection, name: &str, weight: f64, sort_order: i32) -> AppResult<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("category name must not be empty"));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(AppError::validation("category weight must be non-negative"));
        }
        conn.execute(
            r#"
                INSERT INTO kpi_categories (name, weight, sort_order)
                VALUES (:name, :weight, :sort_order)
            "#,
            named_params! {":name": name, ":weight": weight, ":sort_order": sort_order},
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn deactivate(conn: &Connection, id: i64) -> AppResult<()> {
        let affected = conn.execute("UPDATE kpi_categories SET is_active = 0 WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(AppError::not_found());
        }
        Ok(())
    }

    /// Planned hours for one employee, category and month.
    pub fn set_plan(
        conn: &Connection,
        employee_id: i64,
        category_id: i64,
        year: i32,
        month: u32,
        planned_hours: f64,
    ) -> AppResult<()> {
        conn.execute(
            r#"
                INSERT INTO kpi_plans (employee_id, category_id, year, month, planned_hours)
                VALUES (:employee_id, :category_id, :year, :month, :planned_hours)
                ON CONFLICT(employee_id, category_id, year, month) DO UPDATE SET
                    planned_hours = excluded.planned_hours
            "#,
            named_params! {
                ":employee_id": employee_id,
                ":category_id": category_id,
                ":year": year,
                ":month": month,
                ":planned_hours": planned_hours,
            },
        )?;
        Ok(())
    }
}

impl CategorySource for SqliteStore {
    fn list_category_names(&self) -> AppResult<Vec<String>> {
        let rows = self.pool().with_connection(CategoryRepository::list_active)?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }
}
