use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::credential::{Credential, CredentialStatus, NewCredential, ProviderKind};
use crate::services::providers::ProviderFactory;
use crate::services::sources::CredentialStore;
use crate::utils::crypto::{ApiSecret, CryptoVault};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckOutcome {
    pub credential_id: i64,
    pub provider: ProviderKind,
    pub healthy: bool,
}

/// Ordered credential registry. Selection reads a shared snapshot; every state
/// change is written through to the store on a best-effort basis.
pub struct KeyRouter {
    store: Arc<dyn CredentialStore>,
    vault: Arc<CryptoVault>,
    credentials: RwLock<Vec<Credential>>,
}

impl KeyRouter {
    pub fn load(store: Arc<dyn CredentialStore>, vault: Arc<CryptoVault>) -> AppResult<Self> {
        let credentials = store.list_credentials()?;
        info!(target: "app::router", count = credentials.len(), "credential registry loaded");
        Ok(Self {
            store,
            vault,
            credentials: RwLock::new(credentials),
        })
    }

    pub fn list(&self) -> Vec<Credential> {
        self.read_guard().clone()
    }

    pub fn get(&self, id: i64) -> Option<Credential> {
        self.read_guard().iter().find(|credential| credential.id == id).cloned()
    }

    /// Lowest (priority, id) active credential under quota, optionally restricted
    /// to one provider family, skipping `exclude`.
    pub fn select(
        &self,
        family: Option<ProviderKind>,
        exclude: &HashSet<i64>,
    ) -> AppResult<Credential> {
        let guard = self.read_guard();
        let selected = guard
            .iter()
            .filter(|credential| family.map_or(true, |kind| credential.provider == kind))
            .filter(|credential| credential.is_selectable())
            .filter(|credential| !exclude.contains(&credential.id))
            .min_by_key(|credential| (credential.priority, credential.id))
            .cloned();

        match selected {
            Some(credential) => {
                debug!(
                    target: "app::router",
                    credential_id = credential.id,
                    provider = %credential.provider,
                    priority = credential.priority,
                    "credential selected"
                );
                Ok(credential)
            }
            None => {
                let scope = family
                    .map(|kind| kind.as_str().to_string())
                    .unwrap_or_else(|| "any provider".to_string());
                Err(AppError::no_available_credential(scope))
            }
        }
    }

    pub fn mark_degraded(&self, id: i64, reason: &str) {
        let changed = self.mutate(id, |credential| {
            if credential.status == CredentialStatus::Degraded
                && credential.last_error.as_deref() == Some(reason)
            {
                return false;
            }
            credential.status = CredentialStatus::Degraded;
            credential.last_error = Some(reason.to_string());
            credential.last_checked_at = Some(Utc::now());
            true
        });
        if changed {
            warn!(target: "app::router", credential_id = id, %reason, "credential degraded");
        }
    }

    pub fn mark_active(&self, id: i64) {
        let mut restored = false;
        self.mutate(id, |credential| {
            restored = credential.status != CredentialStatus::Active;
            credential.status = CredentialStatus::Active;
            credential.last_error = None;
            credential.last_checked_at = Some(Utc::now());
            true
        });
        if restored {
            info!(target: "app::router", credential_id = id, "credential restored to active");
        }
    }

    /// Counts requests against the daily quota and refreshes the last-checked time.
    pub fn record_usage(&self, id: i64, requests: u64) {
        self.mutate(id, |credential| {
            credential.daily_usage = credential.daily_usage.saturating_add(requests);
            credential.last_checked_at = Some(Utc::now());
            true
        });
    }

    pub fn reset_daily_usage(&self) {
        let reset: Vec<Credential> = {
            let mut guard = self.write_guard();
            guard
                .iter_mut()
                .filter(|credential| credential.daily_usage > 0)
                .map(|credential| {
                    credential.daily_usage = 0;
                    credential.clone()
                })
                .collect()
        };
        info!(target: "app::router", count = reset.len(), "daily usage reset");
        for credential in &reset {
            self.persist(credential);
        }
    }

    pub fn register_credential(&self, input: NewCredential) -> AppResult<Credential> {
        if input.label.trim().is_empty() {
            return Err(AppError::validation("credential label must not be empty"));
        }

        let secret = input
            .secret
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let encrypted = match (secret, input.provider.requires_secret()) {
            (Some(secret), _) => self.vault.encrypt(secret.as_bytes())?,
            (None, false) => String::new(),
            (None, true) => {
                return Err(AppError::validation(format!(
                    "{} credentials require a secret",
                    input.provider
                )))
            }
        };

        let credential = self.store.insert_credential(&input, &encrypted)?;
        info!(
            target: "app::router",
            credential_id = credential.id,
            provider = %credential.provider,
            priority = credential.priority,
            "credential registered"
        );
        self.write_guard().push(credential.clone());
        Ok(credential)
    }

    pub fn remove_credential(&self, id: i64) -> AppResult<()> {
        self.store.delete_credential(id)?;
        self.write_guard().retain(|credential| credential.id != id);
        info!(target: "app::router", credential_id = id, "credential removed");
        Ok(())
    }

    /// Plaintext secret for a credential; `None` for providers that need none.
    pub fn decrypt_secret(&self, credential: &Credential) -> AppResult<Option<ApiSecret>> {
        if credential.encrypted_secret.is_empty() && !credential.provider.requires_secret() {
            return Ok(None);
        }
        self.vault
            .decrypt_secret(credential.id, &credential.encrypted_secret)
            .map(Some)
    }

    /// Probes every credential, degraded ones included, and flips status to match.
    pub async fn run_health_checks(&self, factory: &ProviderFactory) -> Vec<HealthCheckOutcome> {
        let snapshot = self.list();
        let mut outcomes = Vec::with_capacity(snapshot.len());

        for credential in snapshot {
            let healthy = match self
                .decrypt_secret(&credential)
                .and_then(|secret| factory.connect(&credential, secret))
            {
                Ok(provider) => provider.health_check().await,
                Err(err) => {
                    self.mark_degraded(credential.id, &err.to_string());
                    outcomes.push(HealthCheckOutcome {
                        credential_id: credential.id,
                        provider: credential.provider,
                        healthy: false,
                    });
                    continue;
                }
            };

            if healthy {
                self.mark_active(credential.id);
            } else {
                self.mark_degraded(credential.id, "health check failed");
            }
            outcomes.push(HealthCheckOutcome {
                credential_id: credential.id,
                provider: credential.provider,
                healthy,
            });
        }

        info!(
            target: "app::router",
            checked = outcomes.len(),
            healthy = outcomes.iter().filter(|outcome| outcome.healthy).count(),
            "health checks finished"
        );
        outcomes
    }

    fn mutate<F>(&self, id: i64, apply: F) -> bool
    where
        F: FnOnce(&mut Credential) -> bool,
    {
        let updated = {
            let mut guard = self.write_guard();
            let Some(credential) = guard.iter_mut().find(|credential| credential.id == id) else {
                debug!(target: "app::router", credential_id = id, "unknown credential");
                return false;
            };
            if !apply(credential) {
                return false;
            }
            credential.clone()
        };
        self.persist(&updated);
        true
    }

    fn persist(&self, credential: &Credential) {
        if let Err(err) = self.store.update_credential(credential) {
            warn!(
                target: "app::router",
                credential_id = credential.id,
                error = %err,
                "failed to persist credential state"
            );
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Vec<Credential>> {
        self.credentials.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Vec<Credential>> {
        self.credentials.write().unwrap_or_else(PoisonError::into_inner)
    }
}
