use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::billing::ProviderError;

/// The main error type for entitlement and reconciliation operations
#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    /// No authenticated user was attached to the request.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Deployment defect, such as a missing price mapping or a missing free plan row.
    /// Never retried automatically.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Concurrency signal, not a failure. Callers should retry later.
    #[error("sync already in progress")]
    SyncInProgress,

    /// Request could not be parsed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Feature '{feature}' is not included in plan '{plan}'")]
    FeatureNotAvailable { feature: String, plan: String },

    /// One side of a two-system operation was applied and the other failed.
    /// The applied side is left in place.
    #[error("Partial failure after completing [{}]: {message}", .completed.join(", "))]
    PartialFailure {
        completed: Vec<String>,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    error_id: String,
    retryable: bool,
}

impl EntitlementError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether repeating the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SyncInProgress | Self::Storage(_) | Self::PartialFailure { .. } => true,
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Copy of this error for handing the same failure to several waiters.
    /// Opaque `anyhow` errors become `Internal` with the same message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Unauthenticated(m) => Self::Unauthenticated(m.clone()),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Provider(e) => Self::Provider(e.clone()),
            Self::SyncInProgress => Self::SyncInProgress,
            Self::BadRequest(m) => Self::BadRequest(m.clone()),
            Self::InvalidState(m) => Self::InvalidState(m.clone()),
            Self::FeatureNotAvailable { feature, plan } => Self::FeatureNotAvailable {
                feature: feature.clone(),
                plan: plan.clone(),
            },
            Self::PartialFailure { completed, message } => Self::PartialFailure {
                completed: completed.clone(),
                message: message.clone(),
            },
            Self::Storage(m) => Self::Storage(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::Internal(m) => Self::Internal(m.clone()),
            Self::Anyhow(e) => Self::Internal(e.to_string()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::FeatureNotAvailable { .. } => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SyncInProgress => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_)
            | Self::PartialFailure { .. }
            | Self::Storage(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for clients. Server-side details stay in the logs.
    fn safe_message(&self) -> String {
        match self {
            Self::Unauthenticated(_)
            | Self::SyncInProgress
            | Self::BadRequest(_)
            | Self::InvalidState(_)
            | Self::FeatureNotAvailable { .. }
            | Self::NotFound(_) => self.to_string(),
            Self::Provider(_) => "Billing provider error".to_string(),
            Self::PartialFailure { .. } => {
                "Cancellation partially applied; it will be reconciled".to_string()
            }
            Self::Configuration(_) | Self::Storage(_) | Self::Internal(_) | Self::Anyhow(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for EntitlementError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
            retryable: self.is_retryable(),
        });
        (status, body).into_response()
    }
}

/// Result type alias for entitlement operations
pub type Result<T> = std::result::Result<T, EntitlementError>;

impl From<serde_json::Error> for EntitlementError {
    fn from(err: serde_json::Error) -> Self {
        EntitlementError::Internal(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EntitlementError::unauthenticated("missing user").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(EntitlementError::SyncInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            EntitlementError::bad_request("expected value").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EntitlementError::invalid_state("open").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            EntitlementError::configuration("free plan not found").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_configuration_is_not_retryable() {
        assert!(!EntitlementError::configuration("free plan not found").is_retryable());
        assert!(EntitlementError::SyncInProgress.is_retryable());
    }

    #[test]
    fn test_provider_error_converts() {
        let err: EntitlementError = ProviderError::new("list_subscriptions", "boom")
            .with_status(503)
            .into();
        assert!(matches!(err, EntitlementError::Provider(_)));
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_safe_message_hides_configuration_detail() {
        let err = EntitlementError::configuration("price_123 has no plan");
        assert_eq!(err.safe_message(), "Internal server error");
        assert!(err.to_string().contains("price_123"));
    }

    #[test]
    fn test_partial_failure_display() {
        let err = EntitlementError::PartialFailure {
            completed: vec!["sub_1".to_string(), "sub_2".to_string()],
            message: "database unavailable".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("sub_1, sub_2"));
        assert!(display.contains("database unavailable"));
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err: EntitlementError = ProviderError::new("cancel", "boom").with_status(503).into();
        assert!(matches!(err.duplicate(), EntitlementError::Provider(p) if p.http_status == Some(503)));

        let opaque = EntitlementError::from(anyhow::anyhow!("socket closed"));
        assert!(matches!(opaque.duplicate(), EntitlementError::Internal(m) if m == "socket closed"));
    }
}
