use std::path::Path;
use std::sync::Arc;

use crate::db::repositories::SqliteStore;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::models::settings::EngineSettings;
use crate::services::classification_dispatcher::ClassificationDispatcher;
use crate::services::key_router::KeyRouter;
use crate::services::providers::ProviderFactory;
use crate::services::scoring_service::ScoringService;
use crate::services::settings_service::SettingsService;
use crate::services::sources::{AuditSink, TracingAuditSink};
use crate::utils::crypto::CryptoVault;

const VAULT_ACCOUNT: &str = "workpulse-credentials";

/// Everything the worker needs, wired against one SQLite database.
#[derive(Clone)]
pub struct AppState {
    db_pool: DbPool,
    store: Arc<SqliteStore>,
    settings: EngineSettings,
    router: Arc<KeyRouter>,
    factory: ProviderFactory,
    dispatcher: ClassificationDispatcher,
    scoring: ScoringService,
}

impl AppState {
    pub fn new<P: AsRef<Path>>(db_path: P) -> AppResult<Self> {
        let vault = CryptoVault::from_env_or_keyring(VAULT_ACCOUNT)?;
        Self::with_vault(db_path, vault, Arc::new(TracingAuditSink))
    }

    pub fn with_vault<P: AsRef<Path>>(
        db_path: P,
        vault: CryptoVault,
        audit: Arc<dyn AuditSink>,
    ) -> AppResult<Self> {
        let db_pool = DbPool::new(db_path.as_ref())?;
        let settings = SettingsService::new(db_pool.clone()).get()?;
        let store = Arc::new(SqliteStore::new(db_pool.clone()));

        let router = Arc::new(KeyRouter::load(store.clone(), Arc::new(vault))?);
        let factory = ProviderFactory::new(&settings.dispatch)?;
        let dispatcher = ClassificationDispatcher::new(
            Arc::clone(&router),
            factory.clone(),
            store.clone(),
            store.clone(),
            settings.dispatch.clone(),
        );
        let scoring = ScoringService::new(
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            audit,
            &settings,
        );

        Ok(Self {
            db_pool,
            store,
            settings,
            router,
            factory,
            dispatcher,
            scoring,
        })
    }

    pub fn db_pool(&self) -> &DbPool {
        &self.db_pool
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<KeyRouter> {
        &self.router
    }

    pub fn provider_factory(&self) -> &ProviderFactory {
        &self.factory
    }

    pub fn dispatcher(&self) -> &ClassificationDispatcher {
        &self.dispatcher
    }

    pub fn scoring(&self) -> &ScoringService {
        &self.scoring
    }
}
