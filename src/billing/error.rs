//! Error type for calls to the external billing provider.

use std::fmt;

/// A failed call to the billing provider.
///
/// Gateways never retry. The error is handed back to the caller untouched so
/// that batch jobs can count it and single-user flows can surface it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Gateway operation that failed (e.g. `list_active_subscriptions`).
    pub operation: String,
    pub message: String,
    /// Provider-specific error code, when one was returned.
    pub code: Option<String>,
    pub http_status: Option<u16>,
}

impl ProviderError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            code: None,
            http_status: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Request timed out before the provider answered.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::new(operation, "request timed out").with_status(408)
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self.http_status, Some(400..=499))
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self.http_status, Some(500..=599))
    }

    /// Whether a later retry may succeed. Transport failures with no status count as retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.http_status {
            None => true,
            Some(408) | Some(429) => true,
            Some(status) => (500..=599).contains(&status),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Billing provider error during '{}': {}", self.operation, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        if let Some(status) = self.http_status {
            write!(f, " [HTTP {}]", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_status() {
        let err = ProviderError::new("cancel_subscription", "No such subscription")
            .with_code("resource_missing")
            .with_status(404);
        assert_eq!(
            err.to_string(),
            "Billing provider error during 'cancel_subscription': No such subscription (code: resource_missing) [HTTP 404]"
        );
    }

    #[test]
    fn test_classification() {
        let not_found = ProviderError::new("op", "missing").with_status(404);
        assert!(not_found.is_client_error());
        assert!(!not_found.is_retryable());

        let unavailable = ProviderError::new("op", "down").with_status(503);
        assert!(unavailable.is_server_error());
        assert!(unavailable.is_retryable());

        assert!(ProviderError::timeout("op").is_retryable());
        assert!(ProviderError::new("op", "connection reset").is_retryable());
        assert!(ProviderError::new("op", "slow down").with_status(429).is_retryable());
    }
}
