use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tracing::{info, warn};

use crate::db::repositories::settings_repository::SettingsRepository;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::settings::{DispatchSettings, EngineSettings, ManagerKpiWeights, ScoringWeights};

pub const KEY_BATCH_SIZE: &str = "dispatch.batch_size";
pub const KEY_CONCURRENCY: &str = "dispatch.concurrency";
pub const KEY_MAX_ATTEMPTS: &str = "dispatch.max_attempts";
pub const KEY_HTTP_TIMEOUT_SECS: &str = "dispatch.http_timeout_secs";
pub const KEY_SCORING_WEIGHTS: &str = "scoring.weights";
pub const KEY_MANAGER_KPI_WEIGHTS: &str = "scoring.manager_kpi_weights";

const ENV_BATCH_SIZE: &str = "WORKPULSE_BATCH_SIZE";
const ENV_CONCURRENCY: &str = "WORKPULSE_CONCURRENCY";
const ENV_MAX_ATTEMPTS: &str = "WORKPULSE_MAX_ATTEMPTS";
const ENV_HTTP_TIMEOUT_SECS: &str = "WORKPULSE_HTTP_TIMEOUT_SECS";

/// Rows seeded into `app_settings` by the first migration.
pub fn default_setting_rows() -> Vec<(&'static str, String)> {
    let defaults = EngineSettings::default();
    vec![
        (KEY_BATCH_SIZE, defaults.dispatch.batch_size.to_string()),
        (KEY_CONCURRENCY, defaults.dispatch.concurrency.to_string()),
        (KEY_MAX_ATTEMPTS, defaults.dispatch.max_attempts.to_string()),
        (
            KEY_HTTP_TIMEOUT_SECS,
            defaults.dispatch.http_timeout.as_secs().to_string(),
        ),
        (
            KEY_SCORING_WEIGHTS,
            serde_json::to_string(&defaults.scoring).unwrap_or_default(),
        ),
        (
            KEY_MANAGER_KPI_WEIGHTS,
            serde_json::to_string(&defaults.manager_kpi).unwrap_or_default(),
        ),
    ]
}

/// Engine settings resolved from built-in defaults, then `app_settings`, then
/// `WORKPULSE_*` environment variables.
pub struct SettingsService {
    db: DbPool,
    cache: RwLock<Option<EngineSettings>>,
}

impl SettingsService {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            cache: RwLock::new(None),
        }
    }

    pub fn get(&self) -> AppResult<EngineSettings> {
        if let Ok(guard) = self.cache.read() {
            if let Some(settings) = guard.as_ref() {
                return Ok(settings.clone());
            }
        }

        let settings = self.load()?;
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some(settings.clone());
        }
        Ok(settings)
    }

    pub fn load(&self) -> AppResult<EngineSettings> {
        let stored: HashMap<String, String> = self
            .db
            .with_connection(SettingsRepository::list)?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect();

        let settings = apply_stored_values(EngineSettings::default(), &stored);
        let settings = apply_env_overrides(settings, |name| std::env::var(name).ok());
        info!(
            target: "app::settings",
            batch_size = settings.dispatch.batch_size,
            concurrency = settings.dispatch.concurrency,
            max_attempts = settings.dispatch.max_attempts,
            "engine settings loaded"
        );
        Ok(settings)
    }

    pub fn update_scoring_weights(
        &self,
        scoring: ScoringWeights,
        manager_kpi: ManagerKpiWeights,
    ) -> AppResult<EngineSettings> {
        scoring.validate()?;
        manager_kpi.validate()?;

        let scoring_json = serde_json::to_string(&scoring)?;
        let manager_json = serde_json::to_string(&manager_kpi)?;
        self.db.with_transaction(|conn| {
            SettingsRepository::upsert(conn, KEY_SCORING_WEIGHTS, &scoring_json)?;
            SettingsRepository::upsert(conn, KEY_MANAGER_KPI_WEIGHTS, &manager_json)
        })?;

        self.invalidate();
        self.get()
    }

    pub fn update_dispatch(&self, dispatch: &DispatchSettings) -> AppResult<EngineSettings> {
        if dispatch.batch_size == 0 || dispatch.concurrency == 0 || dispatch.max_attempts == 0 {
            return Err(AppError::validation(
                "batch size, concurrency and attempts must be at least 1",
            ));
        }
        if dispatch.http_timeout.is_zero() {
            return Err(AppError::validation("http timeout must be positive"));
        }

        self.db.with_transaction(|conn| {
            SettingsRepository::upsert(conn, KEY_BATCH_SIZE, &dispatch.batch_size.to_string())?;
            SettingsRepository::upsert(conn, KEY_CONCURRENCY, &dispatch.concurrency.to_string())?;
            SettingsRepository::upsert(conn, KEY_MAX_ATTEMPTS, &dispatch.max_attempts.to_string())?;
            SettingsRepository::upsert(
                conn,
                KEY_HTTP_TIMEOUT_SECS,
                &dispatch.http_timeout.as_secs().to_string(),
            )
        })?;

        self.invalidate();
        self.get()
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = None;
        }
    }
}

fn apply_stored_values(mut settings: EngineSettings, stored: &HashMap<String, String>) -> EngineSettings {
    let dispatch = &mut settings.dispatch;
    if let Some(value) = parse_positive(stored.get(KEY_BATCH_SIZE), KEY_BATCH_SIZE) {
        dispatch.batch_size = value;
    }
    if let Some(value) = parse_positive(stored.get(KEY_CONCURRENCY), KEY_CONCURRENCY) {
        dispatch.concurrency = value;
    }
    if let Some(value) = parse_positive(stored.get(KEY_MAX_ATTEMPTS), KEY_MAX_ATTEMPTS) {
        dispatch.max_attempts = value;
    }
    if let Some(value) = parse_positive(stored.get(KEY_HTTP_TIMEOUT_SECS), KEY_HTTP_TIMEOUT_SECS) {
        dispatch.http_timeout = Duration::from_secs(value as u64);
    }

    if let Some(raw) = stored.get(KEY_SCORING_WEIGHTS) {
        match serde_json::from_str::<ScoringWeights>(raw) {
            Ok(weights) if weights.validate().is_ok() => settings.scoring = weights,
            _ => warn!(target: "app::settings", key = KEY_SCORING_WEIGHTS, "ignoring invalid stored weights"),
        }
    }
    if let Some(raw) = stored.get(KEY_MANAGER_KPI_WEIGHTS) {
        match serde_json::from_str::<ManagerKpiWeights>(raw) {
            Ok(weights) if weights.validate().is_ok() => settings.manager_kpi = weights,
            _ => warn!(target: "app::settings", key = KEY_MANAGER_KPI_WEIGHTS, "ignoring invalid stored weights"),
        }
    }

    settings
}

/// Environment overrides win over stored values. Unparseable or zero values are
/// ignored with a warning.
pub fn apply_env_overrides<F>(mut settings: EngineSettings, lookup: F) -> EngineSettings
where
    F: Fn(&str) -> Option<String>,
{
    let dispatch = &mut settings.dispatch;
    if let Some(value) = parse_positive(lookup(ENV_BATCH_SIZE).as_ref(), ENV_BATCH_SIZE) {
        dispatch.batch_size = value;
    }
    if let Some(value) = parse_positive(lookup(ENV_CONCURRENCY).as_ref(), ENV_CONCURRENCY) {
        dispatch.concurrency = value;
    }
    if let Some(value) = parse_positive(lookup(ENV_MAX_ATTEMPTS).as_ref(), ENV_MAX_ATTEMPTS) {
        dispatch.max_attempts = value;
    }
    if let Some(value) = parse_positive(lookup(ENV_HTTP_TIMEOUT_SECS).as_ref(), ENV_HTTP_TIMEOUT_SECS) {
        dispatch.http_timeout = Duration::from_secs(value as u64);
    }
    settings
}

fn parse_positive(raw: Option<&String>, name: &str) -> Option<usize> {
    let raw = raw?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!(target: "app::settings", name, value = %raw, "ignoring invalid setting");
            None
        }
    }
}
