//! Administrator-granted plan overrides and their expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::storage::{EntitlementStore, NewOverride, SubscriptionOverride};
use crate::audit::{AuditEvent, AuditLogger};
use crate::cache::CacheKeys;
use crate::error::{EntitlementError, Result};
use crate::traits::cache::Cache;
use crate::traits::job::ScheduledJob;

/// Something that can force a fresh reconciliation for one user.
#[async_trait]
pub trait ResyncTrigger: Send + Sync {
    async fn force_resync(&self, user_id: &str) -> Result<()>;
}

/// Grants and revokes overrides.
#[derive(Clone)]
pub struct OverrideManager {
    store: Arc<dyn EntitlementStore>,
    cache: Arc<dyn Cache>,
    audit: Arc<dyn AuditLogger>,
}

impl OverrideManager {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        cache: Arc<dyn Cache>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self { store, cache, audit }
    }

    /// Grant `plan_slug` to the user until `expires_at` (`None` never expires).
    ///
    /// Any previously active override is deactivated in the same transaction.
    pub async fn grant(
        &self,
        user_id: &str,
        plan_slug: &str,
        expires_at: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<SubscriptionOverride> {
        if let Some(at) = expires_at {
            if at <= Utc::now() {
                return Err(EntitlementError::invalid_state(
                    "override expiry must be in the future",
                ));
            }
        }

        let created = self
            .store
            .create_override(&NewOverride {
                user_id: user_id.to_string(),
                plan_slug: plan_slug.to_string(),
                expires_at,
                reason: reason.to_string(),
            })
            .await?;

        CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;
        self.audit
            .log(AuditEvent::OverrideGranted {
                user_id: user_id.to_string(),
                plan: plan_slug.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(created)
    }

    /// Deactivate every active override for the user.
    pub async fn revoke(&self, user_id: &str) -> Result<u64> {
        let count = self.store.deactivate_user_overrides(user_id).await?;
        if count > 0 {
            CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;
            self.audit
                .log(AuditEvent::OverrideRevoked {
                    user_id: user_id.to_string(),
                    count,
                })
                .await;
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideExpiryReport {
    pub expired: usize,
    pub deactivated: usize,
    pub resync_failures: usize,
    pub errors: usize,
}

/// Deactivates expired overrides, then asks for a resync of each affected user.
///
/// Deactivation commits before the resync is attempted. A failed resync
/// leaves the deactivation in place; the next access or sweep fixes the rest.
#[derive(Clone)]
pub struct OverrideExpiryMonitor {
    store: Arc<dyn EntitlementStore>,
    cache: Arc<dyn Cache>,
    trigger: Arc<dyn ResyncTrigger>,
    audit: Arc<dyn AuditLogger>,
}

impl OverrideExpiryMonitor {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        cache: Arc<dyn Cache>,
        trigger: Arc<dyn ResyncTrigger>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            store,
            cache,
            trigger,
            audit,
        }
    }

    pub async fn run_once(&self) -> Result<OverrideExpiryReport> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<OverrideExpiryReport> {
        let expired = self.store.list_expired_overrides(now).await?;
        let mut report = OverrideExpiryReport {
            expired: expired.len(),
            ..Default::default()
        };

        for item in expired {
            match self.store.deactivate_override(item.id).await {
                Ok(true) => report.deactivated += 1,
                // Another run got there first
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "plansync::jobs",
                        user_id = %item.user_id,
                        override_id = %item.id,
                        error = %e,
                        "Failed to deactivate expired override"
                    );
                    report.errors += 1;
                    continue;
                }
            }

            CacheKeys::invalidate_user(self.cache.as_ref(), &item.user_id).await;
            self.audit
                .log(AuditEvent::OverrideExpired {
                    user_id: item.user_id.clone(),
                    override_id: item.id.to_string(),
                    plan: item.plan_slug.clone(),
                })
                .await;

            if let Err(e) = self.trigger.force_resync(&item.user_id).await {
                tracing::warn!(
                    target: "plansync::jobs",
                    user_id = %item.user_id,
                    error = %e,
                    "Resync after override expiry failed"
                );
                report.resync_failures += 1;
            }
        }

        tracing::info!(
            target: "plansync::jobs",
            expired = report.expired,
            deactivated = report.deactivated,
            resync_failures = report.resync_failures,
            errors = report.errors,
            "Override expiry run complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl ScheduledJob for OverrideExpiryMonitor {
    fn name(&self) -> &'static str {
        "override_expiry"
    }

    async fn run(&self) -> Result<serde_json::Value> {
        let report = self.run_once().await?;
        Ok(serde_json::to_value(report)?)
    }
}
