//! The external check behind every sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::billing::{sort_canonical_first, BillingGateway};
use crate::entitlements::{EntitlementStore, UpsertSubscription};
use crate::error::Result;

/// How much provider truth a sync re-derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Resolve the customer by email and list its subscriptions.
    Full,
    /// Reuse the stored customer id when there is one.
    Light,
}

/// What a sync found and wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub user_id: String,
    pub mode: SyncMode,
    pub plan: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub active_subscriptions: usize,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the local row was rewritten.
    pub changed: bool,
}

/// Converges one user's local record onto the provider's state.
///
/// Only idempotent upserts are issued, so overlapping runs for the same user
/// are harmless. When several subscriptions are active the canonical one
/// (highest amount, then newest) decides the plan; nothing is cancelled here.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn EntitlementStore>,
    gateway: BillingGateway,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn EntitlementStore>, gateway: BillingGateway) -> Self {
        Self { store, gateway }
    }

    pub fn gateway(&self) -> &BillingGateway {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    pub async fn sync(&self, user_id: &str, force: bool) -> Result<SyncReport> {
        let mode = if force { SyncMode::Full } else { SyncMode::Light };
        let customer_id = self.customer_for(user_id, mode).await?;

        let Some(customer_id) = customer_id else {
            tracing::debug!(target: "plansync::sync", user_id = %user_id, "No billing customer");
            return self.write_free(user_id, mode, None, 0).await;
        };

        let mut active = self.gateway.list_active_subscriptions(&customer_id).await?;
        if active.is_empty() {
            return self.write_free(user_id, mode, Some(customer_id), 0).await;
        }

        let count = active.len();
        if count > 1 {
            tracing::warn!(
                target: "plansync::sync",
                user_id = %user_id,
                customer_id = %customer_id,
                count,
                "Multiple active subscriptions, using the canonical one"
            );
        }
        sort_canonical_first(&mut active);
        let canonical = &active[0];
        let plan = self.gateway.plan_for(canonical)?;

        let outcome = self
            .store
            .upsert_subscription(
                &UpsertSubscription::new(user_id, plan.clone())
                    .customer(Some(customer_id.clone()))
                    .expires_at(Some(canonical.period_end))
                    .subscribed(true)
                    .pending_cancellation(canonical.cancel_at_period_end),
            )
            .await?;

        Ok(SyncReport {
            user_id: user_id.to_string(),
            mode,
            plan,
            customer_id: Some(customer_id),
            subscription_id: Some(canonical.id.clone()),
            active_subscriptions: count,
            expires_at: Some(canonical.period_end),
            changed: outcome.changed,
        })
    }

    async fn customer_for(&self, user_id: &str, mode: SyncMode) -> Result<Option<String>> {
        if mode == SyncMode::Light {
            if let Some(existing) = self.store.get_subscription(user_id).await? {
                if existing.billing_customer_id.is_some() {
                    return Ok(existing.billing_customer_id);
                }
            }
        }

        match self.store.get_billing_profile(user_id).await? {
            Some(profile) => self.gateway.find_customer_by_email(&profile.email).await,
            None => Ok(None),
        }
    }

    async fn write_free(
        &self,
        user_id: &str,
        mode: SyncMode,
        customer_id: Option<String>,
        active_subscriptions: usize,
    ) -> Result<SyncReport> {
        let free = self.gateway.catalog().free_plan().to_string();
        let outcome = self
            .store
            .upsert_subscription(
                &UpsertSubscription::new(user_id, free.clone())
                    .customer(customer_id.clone())
                    .subscribed(false),
            )
            .await?;

        Ok(SyncReport {
            user_id: user_id.to_string(),
            mode,
            plan: free,
            customer_id,
            subscription_id: None,
            active_subscriptions,
            expires_at: None,
            changed: outcome.changed,
        })
    }
}
