pub mod category_repository;
pub mod credential_repository;
pub mod evaluation_repository;
pub mod settings_repository;
pub mod task_log_repository;

use chrono::{DateTime, Utc};

use crate::db::DbPool;

/// SQLite-backed implementation of every `services::sources` trait.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }
}

pub(crate) fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub(crate) fn format_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|timestamp| timestamp.to_rfc3339())
}
