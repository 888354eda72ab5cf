//! Audit trail for entitlement changes.
//!
//! Every component that changes what a user is entitled to reports an
//! [`AuditEvent`]. The default logger writes them through `tracing`.

use async_trait::async_trait;
use std::fmt;

/// Entitlement-changing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    OverrideGranted {
        user_id: String,
        plan: String,
        reason: String,
    },
    OverrideRevoked {
        user_id: String,
        count: u64,
    },
    OverrideExpired {
        user_id: String,
        override_id: String,
        plan: String,
    },
    DuplicatesCancelled {
        user_id: String,
        kept: String,
        cancelled: Vec<String>,
    },
    SubscriptionCancelled {
        user_id: String,
        subscription_ids: Vec<String>,
        immediate: bool,
    },
    PlanCorrected {
        user_id: String,
        from: String,
        to: String,
    },
    CheckoutLinked {
        user_id: String,
        session_id: String,
    },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverrideGranted { user_id, plan, reason } => {
                write!(f, "Override granted: user={}, plan={}, reason={}", user_id, plan, reason)
            }
            Self::OverrideRevoked { user_id, count } => {
                write!(f, "Override revoked: user={}, count={}", user_id, count)
            }
            Self::OverrideExpired { user_id, override_id, plan } => {
                write!(f, "Override expired: user={}, override={}, plan={}", user_id, override_id, plan)
            }
            Self::DuplicatesCancelled { user_id, kept, cancelled } => {
                write!(f, "Duplicate subscriptions cancelled: user={}, kept={}, cancelled=[{}]", user_id, kept, cancelled.join(", "))
            }
            Self::SubscriptionCancelled { user_id, subscription_ids, immediate } => {
                write!(f, "Subscription cancelled: user={}, subs=[{}], immediate={}", user_id, subscription_ids.join(", "), immediate)
            }
            Self::PlanCorrected { user_id, from, to } => {
                write!(f, "Plan corrected: user={}, from={}, to={}", user_id, from, to)
            }
            Self::CheckoutLinked { user_id, session_id } => {
                write!(f, "Checkout linked: user={}, session={}", user_id, session_id)
            }
        }
    }
}

impl AuditEvent {
    /// Event kind for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OverrideGranted { .. } => "override_granted",
            Self::OverrideRevoked { .. } => "override_revoked",
            Self::OverrideExpired { .. } => "override_expired",
            Self::DuplicatesCancelled { .. } => "duplicates_cancelled",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::PlanCorrected { .. } => "plan_corrected",
            Self::CheckoutLinked { .. } => "checkout_linked",
        }
    }
}

/// Audit logging backend.
///
/// Implementations must not fail the operation being audited.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl AuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: AuditEvent) {}
}

/// Logs audit events at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: AuditEvent) {
        tracing::info!(
            target: "plansync::audit",
            event_type = %event.kind(),
            "{}", event
        );
    }
}

/// Audit logger that captures events for assertions.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAuditLogger {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingAuditLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditLogger for RecordingAuditLogger {
        async fn log(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::RecordingAuditLogger;
    use super::*;

    #[tokio::test]
    async fn test_recording_logger() {
        let logger = RecordingAuditLogger::new();
        logger
            .log(AuditEvent::PlanCorrected {
                user_id: "u1".to_string(),
                from: "gestao".to_string(),
                to: "free".to_string(),
            })
            .await;
        TracingAuditLogger
            .log(AuditEvent::OverrideRevoked {
                user_id: "u1".to_string(),
                count: 1,
            })
            .await;

        let events = logger.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "plan_corrected");
    }

    #[test]
    fn test_event_display() {
        let event = AuditEvent::DuplicatesCancelled {
            user_id: "u1".to_string(),
            kept: "sub_b".to_string(),
            cancelled: vec!["sub_a".to_string(), "sub_c".to_string()],
        };
        let display = event.to_string();
        assert!(display.contains("kept=sub_b"));
        assert!(display.contains("sub_a, sub_c"));
    }
}
