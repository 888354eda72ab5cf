//! Cleanup of duplicate active subscriptions for one customer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLogger};
use crate::billing::{sort_canonical_first, BillingGateway};
use crate::cache::CacheKeys;
use crate::entitlements::{EntitlementStore, UpsertSubscription};
use crate::error::Result;
use crate::traits::cache::Cache;

/// A provider cancellation that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCancellation {
    pub subscription_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DuplicateResolution {
    /// The user has no billing customer.
    NoCustomer,
    /// Zero or one active subscription.
    NothingToClean { active: usize },
    Resolved {
        kept: String,
        cancelled: Vec<String>,
        failed: Vec<FailedCancellation>,
        final_plan: String,
    },
}

/// Keeps one canonical subscription per customer and cancels the rest.
///
/// The canonical subscription is the highest amount, then the most recently
/// created. Individual cancellation failures are reported, not fatal.
#[derive(Clone)]
pub struct DuplicateSubscriptionResolver {
    store: Arc<dyn EntitlementStore>,
    gateway: BillingGateway,
    cache: Arc<dyn Cache>,
    audit: Arc<dyn AuditLogger>,
}

impl DuplicateSubscriptionResolver {
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

    pub async fn resolve(&self, user_id: &str) -> Result<DuplicateResolution> {
        let customer_id = match self.store.get_billing_profile(user_id).await? {
            Some(profile) => self.gateway.find_customer_by_email(&profile.email).await?,
            None => None,
        };
        let Some(customer_id) = customer_id else {
            tracing::info!(target: "plansync::sync", user_id = %user_id, "No billing customer, nothing to clean");
            return Ok(DuplicateResolution::NoCustomer);
        };

        let mut active = self.gateway.list_active_subscriptions(&customer_id).await?;
        if active.len() <= 1 {
            return Ok(DuplicateResolution::NothingToClean {
                active: active.len(),
            });
        }

        sort_canonical_first(&mut active);
        let canonical = active.remove(0);
        tracing::warn!(
            target: "plansync::sync",
            user_id = %user_id,
            customer_id = %customer_id,
            kept = %canonical.id,
            duplicates = active.len(),
            "Cancelling duplicate subscriptions"
        );

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();
        for duplicate in &active {
            match self.gateway.cancel(&duplicate.id, true).await {
                Ok(()) => cancelled.push(duplicate.id.clone()),
                Err(e) => {
                    tracing::warn!(
                        target: "plansync::sync",
                        user_id = %user_id,
                        subscription_id = %duplicate.id,
                        error = %e,
                        "Failed to cancel duplicate subscription"
                    );
                    failed.push(FailedCancellation {
                        subscription_id: duplicate.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let final_plan = self.gateway.plan_for(&canonical)?;
        self.store
            .upsert_subscription(
                &UpsertSubscription::new(user_id, final_plan.clone())
                    .customer(Some(canonical.customer_id.clone()))
                    .expires_at(Some(canonical.period_end))
                    .subscribed(true)
                    .pending_cancellation(canonical.cancel_at_period_end),
            )
            .await?;
        CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;

        if !cancelled.is_empty() {
            self.audit
                .log(AuditEvent::DuplicatesCancelled {
                    user_id: user_id.to_string(),
                    kept: canonical.id.clone(),
                    cancelled: cancelled.clone(),
                })
                .await;
        }

        Ok(DuplicateResolution::Resolved {
            kept: canonical.id,
            cancelled,
            failed,
            final_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::test::RecordingAuditLogger;
    use crate::billing::client::test::subscription;
    use crate::billing::{MockBillingClient, PlanCatalog};
    use crate::cache::InMemoryCache;
    use crate::entitlements::InMemoryEntitlementStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        client: Arc<MockBillingClient>,
        store: InMemoryEntitlementStore,
        audit: Arc<RecordingAuditLogger>,
        resolver: DuplicateSubscriptionResolver,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        let audit = Arc::new(RecordingAuditLogger::new());
        store.seed_profile("u1", "ana@example.com");
        let resolver = DuplicateSubscriptionResolver::new(
            Arc::new(store.clone()),
            BillingGateway::new(client.clone(), Arc::new(PlanCatalog::default())),
            Arc::new(InMemoryCache::new(100)),
            audit.clone(),
        );
        Fixture {
            client,
            store,
            audit,
            resolver,
        }
    }

    fn seed_three(client: &MockBillingClient) {
        client.add_customer("ana@example.com", "cus_1");
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        client.add_subscription(subscription("sub_1", "cus_1", "price_a", 6900, t1));
        client.add_subscription(subscription("sub_2", "cus_1", "price_b", 24900, t2));
        client.add_subscription(subscription("sub_3", "cus_1", "price_a", 6900, t3));
    }

    #[tokio::test]
    async fn test_keeps_highest_value_subscription() {
        let f = fixture();
        seed_three(&f.client);

        let resolution = f.resolver.resolve("u1").await.unwrap();
        match resolution {
            DuplicateResolution::Resolved {
                kept,
                mut cancelled,
                failed,
                final_plan,
            } => {
                assert_eq!(kept, "sub_2");
                cancelled.sort();
                assert_eq!(cancelled, vec!["sub_1".to_string(), "sub_3".to_string()]);
                assert!(failed.is_empty());
                assert_eq!(final_plan, "psi_regular");
            }
            other => panic!("unexpected resolution {:?}", other),
        }

        let record = f.store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.plan_slug, "psi_regular");
        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(f.audit.events().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_failure_does_not_abort() {
        let f = fixture();
        seed_three(&f.client);
        f.client.fail_cancel("sub_3");

        let resolution = f.resolver.resolve("u1").await.unwrap();
        let DuplicateResolution::Resolved { cancelled, failed, .. } = resolution else {
            panic!("expected resolution");
        };
        assert_eq!(cancelled, vec!["sub_1".to_string()]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].subscription_id, "sub_3");
        assert_eq!(
            f.store.get_subscription("u1").await.unwrap().unwrap().plan_slug,
            "psi_regular"
        );
    }

    #[tokio::test]
    async fn test_no_customer_and_single_subscription() {
        let f = fixture();
        assert_eq!(f.resolver.resolve("u1").await.unwrap(), DuplicateResolution::NoCustomer);

        f.client.add_customer("ana@example.com", "cus_1");
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        f.client.add_subscription(subscription("sub_1", "cus_1", "price_a", 6900, t));
        assert_eq!(
            f.resolver.resolve("u1").await.unwrap(),
            DuplicateResolution::NothingToClean { active: 1 }
        );
        assert!(f.client.cancelled_now().is_empty());
        assert_eq!(f.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_profile_is_no_customer() {
        let f = fixture();
        assert_eq!(
            f.resolver.resolve("ghost").await.unwrap(),
            DuplicateResolution::NoCustomer
        );
        assert_eq!(f.client.network_calls(), 0);
    }
}
