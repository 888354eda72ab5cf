//! Prewired application context over the in-memory store and mock provider.

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppContext;
use crate::audit::test::RecordingAuditLogger;
use crate::billing::client::test::subscription;
use crate::billing::MockBillingClient;
use crate::cache::InMemoryCache;
use crate::config::Config;
use crate::entitlements::InMemoryEntitlementStore;

/// Helpers for generating test identities
pub mod fake {
    use super::*;

    pub fn user_id() -> String {
        format!("user_{}", &Uuid::new_v4().simple().to_string()[..8])
    }

    pub fn email() -> String {
        format!("test-{}@example.com", Uuid::new_v4().simple())
    }

    pub fn customer_id() -> String {
        format!("cus_{}", &Uuid::new_v4().simple().to_string()[..12])
    }
}

/// An [`AppContext`] plus handles on its fakes.
///
/// The store, provider and audit log are shared with the context, so seeding
/// them after construction is visible to every component.
pub struct TestHarness {
    pub store: Arc<InMemoryEntitlementStore>,
    pub billing: Arc<MockBillingClient>,
    pub audit: Arc<RecordingAuditLogger>,
    pub ctx: AppContext,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryEntitlementStore::new());
        let billing = Arc::new(MockBillingClient::new());
        let audit = Arc::new(RecordingAuditLogger::new());
        let ctx = AppContext::builder()
            .with_config(config)
            .with_store(store.clone())
            .with_billing_client(billing.clone())
            .with_cache(Arc::new(InMemoryCache::new(1_000)))
            .with_audit_logger(audit.clone())
            .build()
            .unwrap();

        Self {
            store,
            billing,
            audit,
            ctx,
        }
    }

    /// Router with every route and this harness's state.
    pub fn router(&self) -> Router {
        crate::http::router(self.ctx.clone())
    }

    /// Seed a profile and a provider customer for the user. Returns the customer id.
    pub fn customer(&self, user_id: &str) -> String {
        let email = format!("{}@example.com", user_id);
        let customer_id = format!("cus_{}", user_id);
        self.store.seed_profile(user_id, &email);
        self.billing.add_customer(&email, &customer_id);
        customer_id
    }

    /// Add an active provider subscription for `customer_id`.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        customer_id: &str,
        amount: i64,
        created: DateTime<Utc>,
    ) {
        self.billing.add_subscription(subscription(
            subscription_id,
            customer_id,
            &format!("price_{}", amount),
            amount,
            created,
        ));
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::EntitlementStore;

    #[tokio::test]
    async fn test_harness_shares_fakes_with_context() {
        let harness = TestHarness::new();
        let customer_id = harness.customer("u1");
        harness.subscribe("sub_1", &customer_id, 6900, Utc::now());

        let report = harness.ctx.syncs.request_sync("u1", true).await.into_result().unwrap();
        assert_eq!(report.plan, "gestao");

        let stored = harness.store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(stored.billing_customer_id.as_deref(), Some(customer_id.as_str()));
    }

    #[test]
    fn test_fake_ids_are_unique() {
        assert_ne!(fake::user_id(), fake::user_id());
        assert!(fake::email().ends_with("@example.com"));
        assert!(fake::customer_id().starts_with("cus_"));
    }
}
