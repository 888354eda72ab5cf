//! Effective plan resolution.
//!
//! Precedence: an active, unexpired override wins; otherwise the stored
//! subscription row (while it still grants its plan); otherwise the free plan.
//! This is the single read path all feature checks use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::storage::EntitlementStore;
use crate::billing::PlanCatalog;
use crate::cache::CacheKeys;
use crate::error::{EntitlementError, Result};
use crate::traits::cache::{Cache, CacheExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Override,
    Subscription,
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePlan {
    pub plan_slug: String,
    pub source: PlanSource,
    /// When the granting override or subscription stops applying.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything a client needs to gate features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSummary {
    pub user_id: String,
    pub plan: String,
    pub source: PlanSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub features: BTreeSet<String>,
    pub usage_limit: Option<u32>,
}

/// Read-only resolver backed by the store and a short-lived cache.
#[derive(Clone)]
pub struct EntitlementResolver {
    store: Arc<dyn EntitlementStore>,
    cache: Arc<dyn Cache>,
    catalog: Arc<PlanCatalog>,
    cache_ttl: Duration,
}

impl EntitlementResolver {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        cache: Arc<dyn Cache>,
        catalog: Arc<PlanCatalog>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            catalog,
            cache_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Resolve the plan at `now`, skipping the cache.
    pub async fn effective_plan_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<EffectivePlan> {
        if let Some(active) = self.store.get_active_override(user_id, now).await? {
            return Ok(EffectivePlan {
                plan_slug: active.plan_slug,
                source: PlanSource::Override,
                expires_at: active.expires_at,
            });
        }

        if let Some(record) = self.store.get_subscription(user_id).await? {
            if record.grants_plan_at(now) && !self.catalog.is_free(&record.plan_slug) {
                return Ok(EffectivePlan {
                    plan_slug: record.plan_slug,
                    source: PlanSource::Subscription,
                    expires_at: record.expires_at,
                });
            }
        }

        Ok(EffectivePlan {
            plan_slug: self.catalog.free_plan().to_string(),
            source: PlanSource::Free,
            expires_at: None,
        })
    }

    /// Current effective plan with source, served from cache when fresh.
    pub async fn resolve(&self, user_id: &str) -> Result<EffectivePlan> {
        let key = CacheKeys::effective_plan(user_id);
        if let Some(cached) = self.read_cache::<EffectivePlan>(&key).await {
            return Ok(cached);
        }

        let now = Utc::now();
        let plan = self.effective_plan_at(user_id, now).await?;
        if let Some(ttl) = self.ttl_for(&plan, now) {
            self.write_cache(&key, &plan, ttl).await;
        }
        Ok(plan)
    }

    /// Current effective plan slug.
    pub async fn effective_plan(&self, user_id: &str) -> Result<String> {
        Ok(self.resolve(user_id).await?.plan_slug)
    }

    pub async fn plan_features(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let key = CacheKeys::plan_features(user_id);
        if let Some(cached) = self.read_cache::<BTreeSet<String>>(&key).await {
            return Ok(cached);
        }

        let now = Utc::now();
        let plan = self.resolve(user_id).await?;
        let features = self.catalog.definition_or_free(&plan.plan_slug)?.features.clone();
        if let Some(ttl) = self.ttl_for(&plan, now) {
            self.write_cache(&key, &features, ttl).await;
        }
        Ok(features)
    }

    /// Usage limit of the effective plan; `None` is unlimited.
    pub async fn usage_limit(&self, user_id: &str) -> Result<Option<u32>> {
        let key = CacheKeys::usage_limit(user_id);
        if let Some(cached) = self.read_cache::<Option<u32>>(&key).await {
            return Ok(cached);
        }

        let now = Utc::now();
        let plan = self.resolve(user_id).await?;
        let limit = self.catalog.definition_or_free(&plan.plan_slug)?.usage_limit;
        if let Some(ttl) = self.ttl_for(&plan, now) {
            self.write_cache(&key, &limit, ttl).await;
        }
        Ok(limit)
    }

    /// Fail with `FeatureNotAvailable` unless the effective plan includes `feature`.
    pub async fn require_feature(&self, user_id: &str, feature: &str) -> Result<()> {
        if self.plan_features(user_id).await?.contains(feature) {
            return Ok(());
        }
        Err(EntitlementError::FeatureNotAvailable {
            feature: feature.to_string(),
            plan: self.effective_plan(user_id).await?,
        })
    }

    pub async fn entitlements(&self, user_id: &str) -> Result<EntitlementSummary> {
        let plan = self.resolve(user_id).await?;
        let features = self.plan_features(user_id).await?;
        let usage_limit = self.usage_limit(user_id).await?;
        Ok(EntitlementSummary {
            user_id: user_id.to_string(),
            plan: plan.plan_slug,
            source: plan.source,
            expires_at: plan.expires_at,
            features,
            usage_limit,
        })
    }

    pub async fn invalidate(&self, user_id: &str) {
        CacheKeys::invalidate_user(self.cache.as_ref(), user_id).await;
    }

    /// Cache TTL capped at the plan's own expiry. `None` when already expired.
    fn ttl_for(&self, plan: &EffectivePlan, now: DateTime<Utc>) -> Option<Duration> {
        match plan.expires_at {
            Some(at) => {
                let remaining = (at - now).to_std().ok()?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.min(self.cache_ttl))
                }
            }
            None => Some(self.cache_ttl),
        }
    }

    async fn read_cache<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        match self.cache.get::<T>(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Entitlement cache read failed");
                None
            }
        }
    }

    async fn write_cache<T>(&self, key: &str, value: &T, ttl: Duration)
    where
        T: Serialize + Send + Sync,
    {
        if let Err(e) = self.cache.set(key, value, Some(ttl)).await {
            tracing::warn!(key = %key, error = %e, "Entitlement cache write failed");
        }
    }
}
