use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Supported classification backends. Adding a backend means adding a variant here
/// and a branch in `ProviderFactory::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    AzureOpenAi,
    OpenAiCompatible,
    HuggingFace,
    Local,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::AzureOpenAi => "azure_openai",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::HuggingFace => "hugging_face",
            ProviderKind::Local => "local",
        }
    }

    pub fn requires_secret(self) -> bool {
        !matches!(self, ProviderKind::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "azure_openai" | "azure" => Ok(ProviderKind::AzureOpenAi),
            "openai_compatible" | "openai" => Ok(ProviderKind::OpenAiCompatible),
            "hugging_face" | "huggingface" => Ok(ProviderKind::HuggingFace),
            "local" => Ok(ProviderKind::Local),
            other => Err(AppError::validation(format!("unknown provider kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Degraded,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Degraded => "degraded",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "active" => Ok(CredentialStatus::Active),
            "degraded" => Ok(CredentialStatus::Degraded),
            other => Err(AppError::validation(format!("unknown credential status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub provider: ProviderKind,
    pub label: String,
    /// `v1:` envelope produced by `CryptoVault::encrypt`; empty for the local provider.
    #[serde(skip_serializing)]
    pub encrypted_secret: String,
    pub priority: i32,
    pub status: CredentialStatus,
    pub daily_usage: u64,
    pub daily_quota: Option<u64>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Credential {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    pub fn quota_exhausted(&self) -> bool {
        self.daily_quota
            .map(|quota| self.daily_usage >= quota)
            .unwrap_or(false)
    }

    pub fn is_selectable(&self) -> bool {
        self.is_active() && !self.quota_exhausted()
    }
}

/// Administrator input for registering a credential. The plaintext secret is
/// encrypted before it reaches the store.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub provider: ProviderKind,
    pub label: String,
    pub secret: Option<String>,
    pub priority: i32,
    pub daily_quota: Option<u64>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
}
