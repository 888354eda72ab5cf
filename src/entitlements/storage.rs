//! Local entitlement storage.
//!
//! Every write to a user's subscription row goes through
//! [`EntitlementStore::upsert_subscription`] or
//! [`EntitlementStore::cancel_subscription`]. Both run as one transaction so a
//! reader never sees a plan without its matching expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Lifecycle of the local subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSubscriptionStatus {
    Active,
    /// Cancelled at period end; plan and expiry stay until the expiry passes.
    PendingCancellation,
    Canceled,
    /// No paying subscription (free plan).
    Inactive,
}

impl LocalSubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingCancellation => "pending_cancellation",
            Self::Canceled => "canceled",
            Self::Inactive => "inactive",
        }
    }

    /// Parse a stored status string. Unknown values read as inactive.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "pending_cancellation" => Self::PendingCancellation,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Inactive,
        }
    }
}

impl std::fmt::Display for LocalSubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The user's locally stored plan. Exactly one row per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSubscriptionRecord {
    pub user_id: String,
    pub plan_slug: String,
    pub status: LocalSubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    /// `None` means no expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub billing_customer_id: Option<String>,
    pub subscribed: bool,
    pub updated_at: DateTime<Utc>,
}

impl LocalSubscriptionRecord {
    /// Whether this row still grants its plan at `now`.
    ///
    /// Cancelled or pending rows stop granting once their expiry has passed.
    #[must_use]
    pub fn grants_plan_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            LocalSubscriptionStatus::Active | LocalSubscriptionStatus::Inactive => true,
            LocalSubscriptionStatus::PendingCancellation | LocalSubscriptionStatus::Canceled => {
                self.expires_at.map(|at| at > now).unwrap_or(false)
            }
        }
    }
}

/// Arguments to [`EntitlementStore::upsert_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertSubscription {
    pub user_id: String,
    pub plan_slug: String,
    pub customer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub subscribed: bool,
    /// The provider subscription is set to end at `expires_at`.
    pub pending_cancellation: bool,
}

impl UpsertSubscription {
    pub fn new(user_id: impl Into<String>, plan_slug: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan_slug: plan_slug.into(),
            customer_id: None,
            expires_at: None,
            subscribed: false,
            pending_cancellation: false,
        }
    }

    #[must_use]
    pub fn customer(mut self, customer_id: Option<String>) -> Self {
        self.customer_id = customer_id;
        self
    }

    #[must_use]
    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[must_use]
    pub fn subscribed(mut self, subscribed: bool) -> Self {
        self.subscribed = subscribed;
        self
    }

    #[must_use]
    pub fn pending_cancellation(mut self, pending: bool) -> Self {
        self.pending_cancellation = pending;
        self
    }

    pub(crate) fn status(&self) -> LocalSubscriptionStatus {
        match (self.subscribed, self.pending_cancellation) {
            (true, false) => LocalSubscriptionStatus::Active,
            (true, true) => LocalSubscriptionStatus::PendingCancellation,
            (false, _) => LocalSubscriptionStatus::Inactive,
        }
    }

    /// Whether applying this upsert to `existing` would change nothing.
    pub(crate) fn matches(&self, existing: &LocalSubscriptionRecord) -> bool {
        existing.plan_slug == self.plan_slug
            && existing.billing_customer_id == self.customer_id
            && existing.expires_at == self.expires_at
            && existing.subscribed == self.subscribed
            && existing.status == self.status()
    }

    /// Row produced by applying this upsert on top of `existing`.
    pub(crate) fn apply(
        &self,
        existing: Option<&LocalSubscriptionRecord>,
        now: DateTime<Utc>,
    ) -> LocalSubscriptionRecord {
        let starts_at = match existing {
            Some(prev) if prev.plan_slug == self.plan_slug => prev.starts_at,
            _ => now,
        };
        LocalSubscriptionRecord {
            user_id: self.user_id.clone(),
            plan_slug: self.plan_slug.clone(),
            status: self.status(),
            starts_at,
            expires_at: self.expires_at,
            billing_customer_id: self.customer_id.clone(),
            subscribed: self.subscribed,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub record: LocalSubscriptionRecord,
    /// False when the stored row already matched and nothing was written.
    pub changed: bool,
}

/// Profile fields used to find the user's billing customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingProfile {
    pub user_id: String,
    pub email: String,
    pub full_name: Option<String>,
}

/// Administrator-granted plan that takes precedence while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOverride {
    pub id: Uuid,
    pub user_id: String,
    pub plan_slug: String,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionOverride {
    #[must_use]
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map(|at| at < now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOverride {
    pub user_id: String,
    pub plan_slug: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
}

/// Persistence for subscription rows, overrides and plan existence.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get_billing_profile(&self, user_id: &str) -> Result<Option<BillingProfile>>;

    async fn get_subscription(&self, user_id: &str) -> Result<Option<LocalSubscriptionRecord>>;

    /// Every row whose plan is not the free plan.
    async fn list_paid_subscriptions(&self) -> Result<Vec<LocalSubscriptionRecord>>;

    /// Insert or replace the user's row in one transaction.
    ///
    /// Calling twice with identical arguments leaves the same end state and
    /// the second call reports `changed == false`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `plan_slug` is not a known plan.
    async fn upsert_subscription(&self, upsert: &UpsertSubscription) -> Result<UpsertOutcome>;

    /// Cancel the user's row in one transaction.
    ///
    /// Immediate cancellation moves the row to the free plan with no expiry.
    /// Otherwise the row is marked pending cancellation and keeps its plan and
    /// expiry. A user with no row gets a cancelled free row.
    ///
    /// # Errors
    ///
    /// Returns `Configuration("free plan not found")` when the free plan row is missing.
    async fn cancel_subscription(&self, user_id: &str, immediate: bool) -> Result<LocalSubscriptionRecord>;

    /// Active override that has not expired at `now`.
    async fn get_active_override(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionOverride>>;

    /// Create an override, deactivating any active one for the same user in
    /// the same transaction.
    async fn create_override(&self, new: &NewOverride) -> Result<SubscriptionOverride>;

    /// Deactivate one override. Returns false if it was already inactive.
    async fn deactivate_override(&self, override_id: Uuid) -> Result<bool>;

    /// Deactivate every active override for the user. Returns how many changed.
    async fn deactivate_user_overrides(&self, user_id: &str) -> Result<u64>;

    /// Active overrides with `expires_at < now`.
    async fn list_expired_overrides(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionOverride>>;

    async fn plan_exists(&self, plan_slug: &str) -> Result<bool>;
}

/// In-memory store for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::EntitlementError;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// In-memory entitlement store with failure injection.
    ///
    /// A single lock guards all tables so each operation is atomic.
    #[derive(Clone)]
    pub struct InMemoryEntitlementStore {
        inner: Arc<RwLock<Tables>>,
        free_plan: String,
    }

    #[derive(Default)]
    struct Tables {
        plans: HashSet<String>,
        profiles: HashMap<String, BillingProfile>,
        subscriptions: HashMap<String, LocalSubscriptionRecord>,
        overrides: Vec<SubscriptionOverride>,
        failing_upserts: HashSet<String>,
        failing_cancels: HashSet<String>,
        fail_override_reads: bool,
        writes: usize,
    }

    impl Default for InMemoryEntitlementStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryEntitlementStore {
        /// Store with the `free`, `gestao` and `psi_regular` plans seeded.
        #[must_use]
        pub fn new() -> Self {
            let store = Self::empty("free");
            store.seed_plans(["free", "gestao", "psi_regular"]);
            store
        }

        /// Store with no plans at all.
        #[must_use]
        pub fn empty(free_plan: &str) -> Self {
            Self {
                inner: Arc::new(RwLock::new(Tables::default())),
                free_plan: free_plan.to_string(),
            }
        }

        pub fn seed_plans<I, S>(&self, plans: I)
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let mut tables = self.inner.write().unwrap();
            tables.plans.extend(plans.into_iter().map(Into::into));
        }

        pub fn seed_profile(&self, user_id: &str, email: &str) {
            self.inner.write().unwrap().profiles.insert(
                user_id.to_string(),
                BillingProfile {
                    user_id: user_id.to_string(),
                    email: email.to_string(),
                    full_name: None,
                },
            );
        }

        /// Write a row directly, bypassing plan validation.
        pub fn seed_subscription(&self, record: LocalSubscriptionRecord) {
            self.inner
                .write()
                .unwrap()
                .subscriptions
                .insert(record.user_id.clone(), record);
        }

        pub fn fail_upserts_for(&self, user_id: &str) {
            self.inner.write().unwrap().failing_upserts.insert(user_id.to_string());
        }

        pub fn fail_cancels_for(&self, user_id: &str) {
            self.inner.write().unwrap().failing_cancels.insert(user_id.to_string());
        }

        pub fn fail_override_reads(&self, fail: bool) {
            self.inner.write().unwrap().fail_override_reads = fail;
        }

        /// Number of row writes that actually changed data.
        pub fn write_count(&self) -> usize {
            self.inner.read().unwrap().writes
        }

        pub fn overrides_for(&self, user_id: &str) -> Vec<SubscriptionOverride> {
            self.inner
                .read()
                .unwrap()
                .overrides
                .iter()
                .filter(|o| o.user_id == user_id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl EntitlementStore for InMemoryEntitlementStore {
        async fn get_billing_profile(&self, user_id: &str) -> Result<Option<BillingProfile>> {
            Ok(self.inner.read().unwrap().profiles.get(user_id).cloned())
        }

        async fn get_subscription(&self, user_id: &str) -> Result<Option<LocalSubscriptionRecord>> {
            Ok(self.inner.read().unwrap().subscriptions.get(user_id).cloned())
        }

        async fn list_paid_subscriptions(&self) -> Result<Vec<LocalSubscriptionRecord>> {
            let tables = self.inner.read().unwrap();
            let mut paid: Vec<_> = tables
                .subscriptions
                .values()
                .filter(|r| r.plan_slug != self.free_plan)
                .cloned()
                .collect();
            paid.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            Ok(paid)
        }

        async fn upsert_subscription(&self, upsert: &UpsertSubscription) -> Result<UpsertOutcome> {
            let mut tables = self.inner.write().unwrap();
            if tables.failing_upserts.contains(&upsert.user_id) {
                return Err(EntitlementError::storage("injected upsert failure"));
            }
            if !tables.plans.contains(&upsert.plan_slug) {
                return Err(EntitlementError::configuration(format!(
                    "plan '{}' not found",
                    upsert.plan_slug
                )));
            }

            if let Some(existing) = tables.subscriptions.get(&upsert.user_id) {
                if upsert.matches(existing) {
                    return Ok(UpsertOutcome {
                        record: existing.clone(),
                        changed: false,
                    });
                }
            }

            let record = upsert.apply(tables.subscriptions.get(&upsert.user_id), Utc::now());
            tables.subscriptions.insert(upsert.user_id.clone(), record.clone());
            tables.writes += 1;
            Ok(UpsertOutcome {
                record,
                changed: true,
            })
        }

        async fn cancel_subscription(&self, user_id: &str, immediate: bool) -> Result<LocalSubscriptionRecord> {
            let mut tables = self.inner.write().unwrap();
            if tables.failing_cancels.contains(user_id) {
                return Err(EntitlementError::storage("injected cancel failure"));
            }
            if !tables.plans.contains(&self.free_plan) {
                return Err(EntitlementError::configuration("free plan not found"));
            }

            let now = Utc::now();
            let existing = tables.subscriptions.get(user_id).cloned();
            let record = cancelled_record(existing, user_id, &self.free_plan, immediate, now);
            tables.subscriptions.insert(user_id.to_string(), record.clone());
            tables.writes += 1;
            Ok(record)
        }

        async fn get_active_override(
            &self,
            user_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<SubscriptionOverride>> {
            let tables = self.inner.read().unwrap();
            if tables.fail_override_reads {
                return Err(EntitlementError::storage("injected override read failure"));
            }
            Ok(tables
                .overrides
                .iter()
                .filter(|o| o.user_id == user_id && o.is_effective_at(now))
                .max_by_key(|o| o.created_at)
                .cloned())
        }

        async fn create_override(&self, new: &NewOverride) -> Result<SubscriptionOverride> {
            let mut tables = self.inner.write().unwrap();
            if !tables.plans.contains(&new.plan_slug) {
                return Err(EntitlementError::configuration(format!(
                    "plan '{}' not found",
                    new.plan_slug
                )));
            }
            for existing in tables.overrides.iter_mut() {
                if existing.user_id == new.user_id && existing.is_active {
                    existing.is_active = false;
                }
            }
            let created = SubscriptionOverride {
                id: Uuid::new_v4(),
                user_id: new.user_id.clone(),
                plan_slug: new.plan_slug.clone(),
                expires_at: new.expires_at,
                reason: new.reason.clone(),
                is_active: true,
                created_at: Utc::now(),
            };
            tables.overrides.push(created.clone());
            Ok(created)
        }

        async fn deactivate_override(&self, override_id: Uuid) -> Result<bool> {
            let mut tables = self.inner.write().unwrap();
            match tables.overrides.iter_mut().find(|o| o.id == override_id) {
                Some(o) if o.is_active => {
                    o.is_active = false;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Err(EntitlementError::not_found(format!("override {}", override_id))),
            }
        }

        async fn deactivate_user_overrides(&self, user_id: &str) -> Result<u64> {
            let mut tables = self.inner.write().unwrap();
            let mut count = 0;
            for o in tables.overrides.iter_mut() {
                if o.user_id == user_id && o.is_active {
                    o.is_active = false;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn list_expired_overrides(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionOverride>> {
            let tables = self.inner.read().unwrap();
            Ok(tables
                .overrides
                .iter()
                .filter(|o| o.is_expired_at(now))
                .cloned()
                .collect())
        }

        async fn plan_exists(&self, plan_slug: &str) -> Result<bool> {
            Ok(self.inner.read().unwrap().plans.contains(plan_slug))
        }
    }
}

/// Row produced by cancelling `existing`.
pub(crate) fn cancelled_record(
    existing: Option<LocalSubscriptionRecord>,
    user_id: &str,
    free_plan: &str,
    immediate: bool,
    now: DateTime<Utc>,
) -> LocalSubscriptionRecord {
    match existing {
        Some(mut record) if !immediate => {
            record.status = LocalSubscriptionStatus::PendingCancellation;
            record.updated_at = now;
            record
        }
        existing => LocalSubscriptionRecord {
            user_id: user_id.to_string(),
            plan_slug: free_plan.to_string(),
            status: LocalSubscriptionStatus::Canceled,
            starts_at: now,
            expires_at: None,
            billing_customer_id: existing.and_then(|r| r.billing_customer_id),
            subscribed: false,
            updated_at: now,
        },
    }
}
