use std::fmt;

use rusqlite;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, warn};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    Unauthorized,
    Forbidden,
    HttpTimeout,
    RateLimited,
    InvalidResponse,
    InvalidRequest,
    Unavailable,
    Unknown,
}

impl ProviderErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorCode::Unauthorized => "UNAUTHORIZED",
            ProviderErrorCode::Forbidden => "FORBIDDEN",
            ProviderErrorCode::HttpTimeout => "HTTP_TIMEOUT",
            ProviderErrorCode::RateLimited => "RATE_LIMITED",
            ProviderErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ProviderErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProviderErrorCode::Unavailable => "PROVIDER_UNAVAILABLE",
            ProviderErrorCode::Unknown => "UNKNOWN_PROVIDER_ERROR",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {message}")]
    Database { message: String },

    #[error("record not found")]
    NotFound,

    #[error("record conflict: {message}")]
    Conflict { message: String },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Option<JsonValue>,
    },

    #[error("credential error: {message}")]
    Credential {
        credential_id: Option<i64>,
        message: String,
    },

    #[error("{message}")]
    Provider {
        code: ProviderErrorCode,
        message: String,
        status: Option<u16>,
        correlation_id: Option<String>,
        details: Option<JsonValue>,
    },

    #[error("no available credential for {scope}")]
    NoAvailableCredential { scope: String },

    #[error("invalid evaluation transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::validation", %message, "validation error");
        AppError::Validation {
            message,
            details: None,
        }
    }

    pub fn credential(credential_id: Option<i64>, message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::credential", credential_id = ?credential_id, %message, "credential error");
        AppError::Credential {
            credential_id,
            message,
        }
    }

    pub fn provider(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self::provider_with_details(code, message, None, None, None)
    }

    pub fn provider_with_details(
        code: ProviderErrorCode,
        message: impl Into<String>,
        status: Option<u16>,
        correlation_id: Option<&str>,
        details: Option<JsonValue>,
    ) -> Self {
        let message = message.into();
        let correlation = correlation_id.map(|value| value.to_string());
        match (&correlation, &details) {
            (Some(id), Some(payload)) => {
                warn!(
                    target: "app::providers::error",
                    code = %code,
                    status = ?status,
                    correlation_id = %id,
                    details = %payload,
                    %message
                );
            }
            (Some(id), None) => {
                warn!(
                    target: "app::providers::error",
                    code = %code,
                    status = ?status,
                    correlation_id = %id,
                    %message
                );
            }
            (None, Some(payload)) => {
                warn!(target: "app::providers::error", code = %code, status = ?status, details = %payload, %message);
            }
            (None, None) => {
                warn!(target: "app::providers::error", code = %code, status = ?status, %message);
            }
        }

        AppError::Provider {
            code,
            message,
            status,
            correlation_id: correlation,
            details,
        }
    }

    pub fn no_available_credential(scope: impl Into<String>) -> Self {
        let scope = scope.into();
        warn!(target: "app::router", %scope, "no available credential");
        AppError::NoAvailableCredential { scope }
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        warn!(target: "app::scoring", %from, %to, "invalid evaluation transition");
        AppError::InvalidTransition { from, to }
    }

    pub fn provider_code(&self) -> Option<ProviderErrorCode> {
        match self {
            AppError::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn provider_status(&self) -> Option<u16> {
        match self {
            AppError::Provider { status, .. } => *status,
            _ => None,
        }
    }

    pub fn provider_correlation_id(&self) -> Option<&str> {
        match self {
            AppError::Provider { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure should move the dispatcher on to the next credential.
    pub fn is_failover(&self) -> bool {
        matches!(self, AppError::Provider { .. })
    }

    pub fn is_credential(&self) -> bool {
        matches!(self, AppError::Credential { .. })
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::conflict", %message, "conflict error");
        AppError::Conflict { message }
    }

    pub fn not_found() -> Self {
        warn!(target: "app::db", "resource not found");
        AppError::NotFound
    }

    pub fn database(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::db", %message, "database error");
        AppError::Database { message }
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::other", %message, "other error");
        AppError::Other(message)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::Error::{QueryReturnedNoRows, SqliteFailure};
        use rusqlite::ErrorCode;

        match &error {
            QueryReturnedNoRows => AppError::not_found(),
            SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                AppError::conflict("unique or check constraint violated")
            }
            _ => {
                error!(target: "app::db", error = ?error, "sqlite error");
                AppError::database(error.to_string())
            }
        }
    }
}
