//! User-initiated cancellation across the provider and the local store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLogger};
use crate::billing::BillingGateway;
use crate::cache::CacheKeys;
use crate::entitlements::{EntitlementStore, LocalSubscriptionRecord};
use crate::error::{EntitlementError, Result};
use crate::traits::cache::Cache;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReport {
    pub user_id: String,
    pub immediate: bool,
    pub customer_id: Option<String>,
    /// Provider subscriptions cancelled or scheduled for period end.
    pub subscription_ids: Vec<String>,
    pub record: LocalSubscriptionRecord,
}

/// Cancels at the provider first, then locally.
///
/// The two steps are separate boundaries. Provider cancellations that went
/// through are never rolled back; if the local step then fails the caller
/// gets [`EntitlementError::PartialFailure`] and the sweep converges later.
#[derive(Clone)]
pub struct CancellationCoordinator {
    store: Arc<dyn EntitlementStore>,
    gateway: BillingGateway,
    cache: Arc<dyn Cache>,
    audit: Arc<dyn AuditLogger>,
}

impl CancellationCoordinator {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: BillingGateway,
        cache: Arc<dyn Cache>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            store,
            gateway,
            cache,
            audit,
        }
    }

    pub async fn cancel(&self, user_id: &str, immediate: bool) -> Result<CancellationReport> {
        let customer_id = match self.store.get_billing_profile(user_id).await? {
            Some(profile) => self.gateway.find_customer_by_email(&profile.email).await?,
            None => None,
        };

        let mut cancelled = Vec::new();
        if let Some(customer_id) = &customer_id {
            let active = self.gateway.list_active_subscriptions(customer_id).await?;
            for subscription in &active {
                if let Err(e) = self.gateway.cancel(&subscription.id, immediate).await {
                    if cancelled.is_empty() {
                        return Err(e);
                    }
                    return Err(self.partial_failure(user_id, cancelled, e));
                }
                cancelled.push(subscription.id.clone());
            }
        } else {
            tracing::info!(target: "plansync::sync", user_id = %user_id, "No billing customer, cancelling locally only");
        }

        let record = match self.store.cancel_subscription(user_id, immediate).await {
            Ok(record) => record,
            // Deployment defect, surfaced as is
            Err(e @ EntitlementError::Configuration(_)) => {
                if !cancelled.is_empty() {
                    tracing::error!(
                        target: "plansync::sync",
                        user_id = %user_id,
                        subscription_ids = ?cancelled,
                        "Provider cancellation applied but local cancellation is misconfigured"
                    );
                }
                return Err(e);
            }
            Err(e) if !cancelled.is_empty() => return Err(self.partial_failure(user_id, cancelled, e)),
            Err(e) => return Err(e),
        };

        CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;
        self.audit
            .log(AuditEvent::SubscriptionCancelled {
                user_id: user_id.to_string(),
                subscription_ids: cancelled.clone(),
                immediate,
            })
            .await;

        Ok(CancellationReport {
            user_id: user_id.to_string(),
            immediate,
            customer_id,
            subscription_ids: cancelled,
            record,
        })
    }

    fn partial_failure(&self, user_id: &str, completed: Vec<String>, cause: EntitlementError) -> EntitlementError {
        tracing::error!(
            target: "plansync::sync",
            user_id = %user_id,
            completed = ?completed,
            error = %cause,
            "Cancellation partially applied"
        );
        EntitlementError::PartialFailure {
            completed,
            message: cause.to_string(),
        }
    }
}
