use std::convert::TryFrom;

use rusqlite::{named_params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, SqliteStore};
use crate::error::{AppError, AppResult};
use crate::models::credential::{Credential, NewCredential};
use crate::services::sources::CredentialStore;

const SELECT_COLUMNS: &str = r#"
    id, provider, label, encrypted_secret, priority, status, daily_usage, daily_quota,
    model, endpoint, api_version, last_checked_at, last_error
"#;

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: i64,
    pub provider: String,
    pub label: String,
    pub encrypted_secret: String,
    pub priority: i32,
    pub status: String,
    pub daily_usage: i64,
    pub daily_quota: Option<i64>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub last_checked_at: Option<String>,
    pub last_error: Option<String>,
}

impl TryFrom<&Row<'_>> for CredentialRow {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'_>) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            provider: row.get("provider")?,
            label: row.get("label")?,
            encrypted_secret: row.get("encrypted_secret")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            daily_usage: row.get("daily_usage")?,
            daily_quota: row.get("daily_quota")?,
            model: row.get("model")?,
            endpoint: row.get("endpoint")?,
            api_version: row.get("api_version")?,
            last_checked_at: row.get("last_checked_at")?,
            last_error: row.get("last_error")?,
        })
    }
}

impl CredentialRow {
    pub fn into_credential(self) -> AppResult<Credential> {
        Ok(Credential {
            id: self.id,
            provider: self.provider.parse()?,
            label: self.label,
            encrypted_secret: self.encrypted_secret,
            priority: self.priority,
            status: self.status.parse()?,
            daily_usage: self.daily_usage.max(0) as u64,
            daily_quota: self.daily_quota.map(|quota| quota.max(0) as u64),
            model: self.model,
            endpoint: self.endpoint,
            api_version: self.api_version,
            last_checked_at: parse_timestamp(self.last_checked_at),
            last_error: self.last_error,
        })
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub struct CredentialRepository;

impl CredentialRepository {
    pub fn list(conn: &Connection) -> AppResult<Vec<Credential>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM provider_credentials ORDER BY priority ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| CredentialRow::try_from(row))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    pub fn find(conn: &Connection, id: i64) -> AppResult<Option<Credential>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM provider_credentials WHERE id = ?1");
        conn.query_row(&sql, [id], |row| CredentialRow::try_from(row))
            .optional()?
            .map(CredentialRow::into_credential)
            .transpose()
    }

    pub fn insert(conn: &Connection, input: &NewCredential, encrypted_secret: &str) -> AppResult<Credential> {
        conn.execute(
            r#"
                INSERT INTO provider_credentials (
                    provider, label, encrypted_secret, priority, status,
                    daily_usage, daily_quota, model, endpoint, api_version
                ) VALUES (
                    :provider, :label, :encrypted_secret, :priority, 'active',
                    0, :daily_quota, :model, :endpoint, :api_version
                )
            "#,
            named_params! {
                ":provider": input.provider.as_str(),
                ":label": input.label.trim(),
                ":encrypted_secret": encrypted_secret,
                ":priority": input.priority,
                ":daily_quota": input.daily_quota.map(to_sql_count),
                ":model": input.model,
                ":endpoint": input.endpoint,
                ":api_version": input.api_version,
            },
        )?;

        let id = conn.last_insert_rowid();
        Self::find(conn, id)?.ok_or_else(AppError::not_found)
    }

    /// Writes back the mutable state the router owns.
    pub fn update_state(conn: &Connection, credential: &Credential) -> AppResult<()> {
        let affected = conn.execute(
            r#"
                UPDATE provider_credentials SET
                    status = :status,
                    daily_usage = :daily_usage,
                    priority = :priority,
                    last_checked_at = :last_checked_at,
                    last_error = :last_error,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = :id
            "#,
            named_params! {
                ":id": credential.id,
                ":status": credential.status.as_str(),
                ":daily_usage": to_sql_count(credential.daily_usage),
                ":priority": credential.priority,
                ":last_checked_at": format_timestamp(credential.last_checked_at),
                ":last_error": credential.last_error,
            },
        )?;
        if affected == 0 {
            return Err(AppError::not_found());
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> AppResult<()> {
        let affected = conn.execute("DELETE FROM provider_credentials WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(AppError::not_found());
        }
        Ok(())
    }
}

impl CredentialStore for SqliteStore {
    fn list_credentials(&self) -> AppResult<Vec<Credential>> {
        self.pool().with_connection(CredentialRepository::list)
    }

    fn insert_credential(&self, input: &NewCredential, encrypted_secret: &str) -> AppResult<Credential> {
        self.pool()
            .with_connection(|conn| CredentialRepository::insert(conn, input, encrypted_secret))
    }

    fn update_credential(&self, credential: &Credential) -> AppResult<()> {
        self.pool()
            .with_connection(|conn| CredentialRepository::update_state(conn, credential))
    }

    fn delete_credential(&self, id: i64) -> AppResult<()> {
        self.pool()
            .with_connection(|conn| CredentialRepository::delete(conn, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbPool;
    use crate::models::credential::{CredentialStatus, ProviderKind};
    use chrono::Utc;
    use tempfile::tempdir;

    fn input() -> NewCredential {
        NewCredential {
            provider: ProviderKind::AzureOpenAi,
            label: " azure-east ".into(),
            secret: None,
            priority: 5,
            daily_quota: Some(100),
            model: Some("gpt-4o".into()),
            endpoint: Some("https://acme.openai.azure.com".into()),
            api_version: None,
        }
    }

    #[test]
    fn insert_and_update_round_trip_state() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());

        let mut credential = store.insert_credential(&input(), "v1:cipher").unwrap();
        assert_eq!(credential.label, "azure-east");
        assert_eq!(credential.status, CredentialStatus::Active);
        assert_eq!(credential.daily_quota, Some(100));

        credential.status = CredentialStatus::Degraded;
        credential.daily_usage = 7;
        credential.last_error = Some("status 500".into());
        credential.last_checked_at = Some(Utc::now());
        store.update_credential(&credential).unwrap();

        let listed = store.list_credentials().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, CredentialStatus::Degraded);
        assert_eq!(listed[0].daily_usage, 7);
        assert_eq!(listed[0].encrypted_secret, "v1:cipher");
        assert!(listed[0].last_checked_at.is_some());
    }

    #[test]
    fn deleting_missing_credential_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(DbPool::new(dir.path().join("db.sqlite")).unwrap());
        assert!(matches!(store.delete_credential(42), Err(AppError::NotFound)));
    }
}
