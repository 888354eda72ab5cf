//! Scheduled drift correction for every paid user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLogger};
use crate::billing::BillingGateway;
use crate::cache::CacheKeys;
use crate::entitlements::{EntitlementStore, LocalSubscriptionRecord, UpsertSubscription};
use crate::error::Result;
use crate::traits::cache::Cache;
use crate::traits::job::ScheduledJob;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum UserOutcome {
    Unchanged,
    Updated,
    Skipped,
}

/// Walks every local record on a paid plan and corrects it against the provider.
///
/// A failure for one user is logged and counted; the sweep always finishes.
/// All writes are idempotent upserts, so overlapping sweeps converge.
#[derive(Clone)]
pub struct ReconciliationSweep {
    store: Arc<dyn EntitlementStore>,
    gateway: BillingGateway,
    cache: Arc<dyn Cache>,
    audit: Arc<dyn AuditLogger>,
}

impl ReconciliationSweep {
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

    pub async fn run_once(&self) -> Result<SweepReport> {
        let records = self.store.list_paid_subscriptions().await?;
        let mut report = SweepReport::default();

        for record in &records {
            report.processed += 1;
            match self.reconcile(record).await {
                Ok(UserOutcome::Updated) => report.updated += 1,
                Ok(UserOutcome::Unchanged) => {}
                Ok(UserOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "plansync::jobs",
                        user_id = %record.user_id,
                        error = %e,
                        "Reconciliation failed for user"
                    );
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            target: "plansync::jobs",
            processed = report.processed,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors,
            "Reconciliation sweep complete"
        );
        Ok(report)
    }

    async fn reconcile(&self, record: &LocalSubscriptionRecord) -> Result<UserOutcome> {
        let user_id = record.user_id.as_str();
        let customer_id = match self.store.get_billing_profile(user_id).await? {
            Some(profile) => self.gateway.find_customer_by_email(&profile.email).await?,
            None => None,
        };
        let Some(customer_id) = customer_id else {
            tracing::info!(target: "plansync::jobs", user_id = %user_id, "No billing customer, skipping");
            return Ok(UserOutcome::Skipped);
        };

        let active = self.gateway.list_active_subscriptions(&customer_id).await?;
        let upsert = match active.first() {
            None => UpsertSubscription::new(user_id, self.gateway.catalog().free_plan())
                .customer(Some(customer_id))
                .subscribed(false),
            Some(subscription) => {
                let plan = self.gateway.plan_for(subscription)?;
                if plan == record.plan_slug {
                    return Ok(UserOutcome::Unchanged);
                }
                UpsertSubscription::new(user_id, plan)
                    .customer(Some(customer_id))
                    .expires_at(Some(subscription.period_end))
                    .subscribed(true)
                    .pending_cancellation(subscription.cancel_at_period_end)
            }
        };

        let outcome = self.store.upsert_subscription(&upsert).await?;
        if !outcome.changed {
            return Ok(UserOutcome::Unchanged);
        }

        CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;
        self.audit
            .log(AuditEvent::PlanCorrected {
                user_id: user_id.to_string(),
                from: record.plan_slug.clone(),
                to: upsert.plan_slug.clone(),
            })
            .await;
        Ok(UserOutcome::Updated)
    }
}

#[async_trait]
impl ScheduledJob for ReconciliationSweep {
    fn name(&self) -> &'static str {
        "reconciliation_sweep"
    }

    async fn run(&self) -> Result<serde_json::Value> {
        let report = self.run_once().await?;
        Ok(serde_json::to_value(report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::test::RecordingAuditLogger;
    use crate::billing::client::test::subscription;
    use crate::billing::{MockBillingClient, PlanCatalog};
    use crate::cache::InMemoryCache;
    use crate::entitlements::{InMemoryEntitlementStore, LocalSubscriptionStatus};
    use chrono::{TimeZone, Utc};

    async fn paid(store: &InMemoryEntitlementStore, user_id: &str, email: &str, plan: &str) {
        store.seed_profile(user_id, email);
        store
            .upsert_subscription(&UpsertSubscription::new(user_id, plan).subscribed(true))
            .await
            .unwrap();
    }

    fn sweep(client: Arc<MockBillingClient>, store: &InMemoryEntitlementStore) -> ReconciliationSweep {
        ReconciliationSweep::new(
            Arc::new(store.clone()),
            BillingGateway::new(client, Arc::new(PlanCatalog::default())),
            Arc::new(InMemoryCache::new(100)),
            Arc::new(RecordingAuditLogger::new()),
        )
    }

    #[tokio::test]
    async fn test_downgrades_user_without_subscriptions_despite_other_failure() {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        paid(&store, "u1", "one@example.com", "gestao").await;
        paid(&store, "u2", "two@example.com", "gestao").await;
        client.add_customer("one@example.com", "cus_1");
        client.fail_customer_lookup("two@example.com");

        let report = sweep(client, &store).run_once().await.unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors, 1);
        let record = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.plan_slug, "free");
        assert!(!record.subscribed);
        assert_eq!(record.expires_at, None);
    }

    #[tokio::test]
    async fn test_corrects_plan_and_skips_matching() {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        paid(&store, "u1", "one@example.com", "gestao").await;
        paid(&store, "u2", "two@example.com", "gestao").await;
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        client.add_customer("one@example.com", "cus_1");
        client.add_customer("two@example.com", "cus_2");
        client.add_subscription(subscription("sub_1", "cus_1", "price_b", 24900, t));
        client.add_subscription(subscription("sub_2", "cus_2", "price_a", 6900, t));

        let sweep = sweep(client, &store);
        let report = sweep.run_once().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(
            store.get_subscription("u1").await.unwrap().unwrap().plan_slug,
            "psi_regular"
        );

        // Second pass converges to no writes
        let writes = store.write_count();
        let again = sweep.run_once().await.unwrap();
        assert_eq!(again.updated, 0);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_corrected_plan_keeps_period_end_cancellation() {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        paid(&store, "u1", "one@example.com", "gestao").await;
        client.add_customer("one@example.com", "cus_1");
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut lapsing = subscription("sub_1", "cus_1", "price_b", 24900, t);
        lapsing.cancel_at_period_end = true;
        client.add_subscription(lapsing);

        let report = sweep(client, &store).run_once().await.unwrap();
        assert_eq!(report.updated, 1);
        let record = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.plan_slug, "psi_regular");
        assert_eq!(record.status, LocalSubscriptionStatus::PendingCancellation);
    }

    #[tokio::test]
    async fn test_user_without_customer_is_skipped() {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        paid(&store, "u1", "one@example.com", "gestao").await;

        let value = sweep(client, &store).run().await.unwrap();
        assert_eq!(value["skipped"], 1);
        assert_eq!(value["errors"], 0);
        assert_eq!(
            store.get_subscription("u1").await.unwrap().unwrap().plan_slug,
            "gestao"
        );
    }
}
