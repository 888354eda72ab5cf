//! Gateway combining the provider client with plan mapping.

use std::collections::HashMap;
use std::sync::Arc;

use super::client::{BillingClient, BillingSubscription, CheckoutSession};
use super::error::ProviderError;
use super::plans::PlanCatalog;
use crate::error::Result;

/// Adapter every reconciliation component talks to.
///
/// Provider failures come back as [`ProviderError`] wrapped in the crate error.
/// Nothing here retries.
#[derive(Clone)]
pub struct BillingGateway {
    client: Arc<dyn BillingClient>,
    catalog: Arc<PlanCatalog>,
}

impl BillingGateway {
    pub fn new(client: Arc<dyn BillingClient>, catalog: Arc<PlanCatalog>) -> Self {
        Self { client, catalog }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn client(&self) -> &Arc<dyn BillingClient> {
        &self.client
    }

    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<String>> {
        self.client
            .find_customer_by_email(email)
            .await
            .map_err(|e| log_provider_error(e, None))
    }

    pub async fn list_active_subscriptions(&self, customer_id: &str) -> Result<Vec<BillingSubscription>> {
        self.client
            .list_active_subscriptions(customer_id)
            .await
            .map_err(|e| log_provider_error(e, Some(customer_id)))
    }

    /// Cancel now, or schedule cancellation at the end of the current period.
    pub async fn cancel(&self, subscription_id: &str, immediate: bool) -> Result<()> {
        let result = if immediate {
            self.client.cancel_subscription_now(subscription_id).await
        } else {
            self.client.cancel_subscription_at_period_end(subscription_id).await
        };
        result.map_err(|e| log_provider_error(e, Some(subscription_id)))?;

        tracing::info!(
            target: "plansync::billing",
            subscription_id = %subscription_id,
            immediate,
            "Subscription cancelled at provider"
        );
        Ok(())
    }

    pub fn resolve_plan_from_price(&self, price_id: &str, amount: i64) -> Result<String> {
        self.catalog.resolve_plan_from_price(price_id, amount)
    }

    /// Plan slug for a provider subscription.
    pub fn plan_for(&self, subscription: &BillingSubscription) -> Result<String> {
        self.resolve_plan_from_price(&subscription.price_id, subscription.amount)
    }

    pub async fn retrieve_checkout_session(&self, session_id: &str) -> Result<CheckoutSession> {
        self.client
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| log_provider_error(e, Some(session_id)))
    }

    pub async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .update_customer_metadata(customer_id, metadata)
            .await
            .map_err(|e| log_provider_error(e, Some(customer_id)))
    }

    pub async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .update_subscription_metadata(subscription_id, metadata)
            .await
            .map_err(|e| log_provider_error(e, Some(subscription_id)))
    }

    pub async fn update_checkout_session_metadata(
        &self,
        session_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .update_checkout_session_metadata(session_id, metadata)
            .await
            .map_err(|e| log_provider_error(e, Some(session_id)))
    }
}

fn log_provider_error(err: ProviderError, resource: Option<&str>) -> crate::error::EntitlementError {
    tracing::warn!(
        target: "plansync::billing",
        operation = %err.operation,
        resource = resource.unwrap_or(""),
        http_status = err.http_status,
        error = %err,
        "Billing provider call failed"
    );
    err.into()
}

/// Order subscriptions so the canonical one comes first: highest amount,
/// then most recently created.
pub fn sort_canonical_first(subscriptions: &mut [BillingSubscription]) {
    subscriptions.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| b.created.cmp(&a.created))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::test::{subscription, MockBillingClient};
    use crate::error::EntitlementError;
    use chrono::{TimeZone, Utc};

    fn gateway(client: Arc<MockBillingClient>) -> BillingGateway {
        BillingGateway::new(client, Arc::new(PlanCatalog::default()))
    }

    #[tokio::test]
    async fn test_cancel_immediate_and_period_end() {
        let client = Arc::new(MockBillingClient::new());
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        client.add_subscription(subscription("sub_1", "cus_1", "price_a", 6900, t));
        client.add_subscription(subscription("sub_2", "cus_1", "price_a", 6900, t));
        let gateway = gateway(client.clone());

        gateway.cancel("sub_1", true).await.unwrap();
        gateway.cancel("sub_2", false).await.unwrap();

        assert_eq!(client.cancelled_now(), vec!["sub_1".to_string()]);
        assert_eq!(client.cancelled_at_period_end(), vec!["sub_2".to_string()]);
        let active = gateway.list_active_subscriptions("cus_1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_provider_error_propagates_untouched() {
        let client = Arc::new(MockBillingClient::new());
        client.fail_subscription_list("cus_1");
        let gateway = gateway(client.clone());

        let err = gateway.list_active_subscriptions("cus_1").await.unwrap_err();
        match err {
            EntitlementError::Provider(p) => {
                assert_eq!(p.operation, "list_active_subscriptions");
                assert_eq!(p.http_status, Some(503));
            }
            other => panic!("expected provider error, got {:?}", other),
        }
        // One call, no retries
        assert_eq!(client.subscription_list_calls(), 1);
    }

    #[test]
    fn test_sort_canonical_first() {
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        let mut subs = vec![
            subscription("sub_a", "cus", "p", 6900, t1),
            subscription("sub_b", "cus", "p", 24900, t2),
            subscription("sub_c", "cus", "p", 6900, t3),
        ];
        sort_canonical_first(&mut subs);
        let ids: Vec<_> = subs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sub_b", "sub_c", "sub_a"]);
    }
}
