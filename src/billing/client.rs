//! Provider-facing client trait and the records it returns.
//!
//! [`BillingClient`] is the raw seam to the billing provider. Higher layers use
//! [`BillingGateway`](super::BillingGateway), which adds plan mapping and
//! logging on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::ProviderError;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// An active subscription as reported by the provider. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSubscription {
    pub id: String,
    pub customer_id: String,
    /// Provider status string (e.g. `active`, `trialing`)
    pub status: String,
    pub price_id: String,
    /// Unit amount in minor currency units
    pub amount: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Open,
    Complete,
    Expired,
}

impl CheckoutStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Complete => "complete",
            Self::Expired => "expired",
        }
    }
}

/// A checkout session as reported by the provider. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub status: CheckoutStatus,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Raw operations against the billing provider.
///
/// Implementations perform exactly one provider request per call and never retry.
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Resolve a customer id by email. `Ok(None)` when no customer matches.
    async fn find_customer_by_email(&self, email: &str) -> ProviderResult<Option<String>>;

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> ProviderResult<Vec<BillingSubscription>>;

    async fn cancel_subscription_now(&self, subscription_id: &str) -> ProviderResult<()>;

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> ProviderResult<()>;

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession>;

    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()>;

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()>;

    async fn update_checkout_session_metadata(
        &self,
        session_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()>;
}

/// Mock billing client for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::RwLock;

    #[derive(Default)]
    struct MockState {
        customers: HashMap<String, String>,
        subscriptions: HashMap<String, BillingSubscription>,
        sessions: HashMap<String, CheckoutSession>,
        customer_metadata: HashMap<String, HashMap<String, String>>,
        subscription_metadata: HashMap<String, HashMap<String, String>>,
        cancelled_now: Vec<String>,
        cancelled_at_period_end: Vec<String>,
        failing_emails: HashSet<String>,
        failing_customers: HashSet<String>,
        failing_cancels: HashSet<String>,
        fail_metadata: bool,
    }

    /// In-memory provider with failure injection and call counters.
    ///
    /// Immediate cancellation removes the subscription from the active list.
    /// Period-end cancellation keeps it active with `cancel_at_period_end` set.
    #[derive(Default)]
    pub struct MockBillingClient {
        state: RwLock<MockState>,
        customer_lookups: AtomicUsize,
        subscription_lists: AtomicUsize,
        latency: RwLock<Option<std::time::Duration>>,
    }

    impl MockBillingClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_customer(&self, email: &str, customer_id: &str) {
            self.state
                .write()
                .unwrap()
                .customers
                .insert(email.to_string(), customer_id.to_string());
        }

        pub fn add_subscription(&self, subscription: BillingSubscription) {
            self.state
                .write()
                .unwrap()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        pub fn add_checkout_session(&self, session: CheckoutSession) {
            self.state
                .write()
                .unwrap()
                .sessions
                .insert(session.id.clone(), session);
        }

        /// Make customer lookups for this email fail.
        pub fn fail_customer_lookup(&self, email: &str) {
            self.state.write().unwrap().failing_emails.insert(email.to_string());
        }

        /// Make subscription listing for this customer fail.
        pub fn fail_subscription_list(&self, customer_id: &str) {
            self.state
                .write()
                .unwrap()
                .failing_customers
                .insert(customer_id.to_string());
        }

        /// Make cancellation of this subscription fail.
        pub fn fail_cancel(&self, subscription_id: &str) {
            self.state
                .write()
                .unwrap()
                .failing_cancels
                .insert(subscription_id.to_string());
        }

        /// Delay customer lookups and subscription listings.
        pub fn set_latency(&self, latency: std::time::Duration) {
            *self.latency.write().unwrap() = Some(latency);
        }

        async fn simulate_latency(&self) {
            let latency = *self.latency.read().unwrap();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
        }

        pub fn fail_metadata_updates(&self) {
            self.state.write().unwrap().fail_metadata = true;
        }

        pub fn cancelled_now(&self) -> Vec<String> {
            self.state.read().unwrap().cancelled_now.clone()
        }

        pub fn cancelled_at_period_end(&self) -> Vec<String> {
            self.state.read().unwrap().cancelled_at_period_end.clone()
        }

        pub fn customer_metadata(&self, customer_id: &str) -> Option<HashMap<String, String>> {
            self.state.read().unwrap().customer_metadata.get(customer_id).cloned()
        }

        pub fn subscription_metadata(&self, subscription_id: &str) -> Option<HashMap<String, String>> {
            self.state
                .read()
                .unwrap()
                .subscription_metadata
                .get(subscription_id)
                .cloned()
        }

        pub fn session_metadata(&self, session_id: &str) -> Option<HashMap<String, String>> {
            self.state
                .read()
                .unwrap()
                .sessions
                .get(session_id)
                .map(|s| s.metadata.clone())
        }

        /// Number of provider round trips made so far.
        pub fn network_calls(&self) -> usize {
            self.customer_lookups.load(Ordering::SeqCst) + self.subscription_lists.load(Ordering::SeqCst)
        }

        pub fn subscription_list_calls(&self) -> usize {
            self.subscription_lists.load(Ordering::SeqCst)
        }
    }

    fn unavailable(operation: &str) -> ProviderError {
        ProviderError::new(operation, "injected failure").with_status(503)
    }

    fn missing(operation: &str, id: &str) -> ProviderError {
        ProviderError::new(operation, format!("No such object: {}", id))
            .with_code("resource_missing")
            .with_status(404)
    }

    #[async_trait]
    impl BillingClient for MockBillingClient {
        async fn find_customer_by_email(&self, email: &str) -> ProviderResult<Option<String>> {
            self.customer_lookups.fetch_add(1, Ordering::SeqCst);
            self.simulate_latency().await;
            let state = self.state.read().unwrap();
            if state.failing_emails.contains(email) {
                return Err(unavailable("find_customer_by_email"));
            }
            Ok(state.customers.get(email).cloned())
        }

        async fn list_active_subscriptions(
            &self,
            customer_id: &str,
        ) -> ProviderResult<Vec<BillingSubscription>> {
            self.subscription_lists.fetch_add(1, Ordering::SeqCst);
            self.simulate_latency().await;
            let state = self.state.read().unwrap();
            if state.failing_customers.contains(customer_id) {
                return Err(unavailable("list_active_subscriptions"));
            }
            let mut subs: Vec<_> = state
                .subscriptions
                .values()
                .filter(|s| s.customer_id == customer_id && s.status == "active")
                .cloned()
                .collect();
            // Provider order is newest first
            subs.sort_by(|a, b| b.created.cmp(&a.created));
            Ok(subs)
        }

        async fn cancel_subscription_now(&self, subscription_id: &str) -> ProviderResult<()> {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            if state.failing_cancels.contains(subscription_id) {
                return Err(unavailable("cancel_subscription_now"));
            }
            match state.subscriptions.get_mut(subscription_id) {
                Some(sub) => {
                    sub.status = "canceled".to_string();
                    state.cancelled_now.push(subscription_id.to_string());
                    Ok(())
                }
                None => Err(missing("cancel_subscription_now", subscription_id)),
            }
        }

        async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> ProviderResult<()> {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            if state.failing_cancels.contains(subscription_id) {
                return Err(unavailable("cancel_subscription_at_period_end"));
            }
            match state.subscriptions.get_mut(subscription_id) {
                Some(sub) => {
                    sub.cancel_at_period_end = true;
                    state.cancelled_at_period_end.push(subscription_id.to_string());
                    Ok(())
                }
                None => Err(missing("cancel_subscription_at_period_end", subscription_id)),
            }
        }

        async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession> {
            self.state
                .read()
                .unwrap()
                .sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| missing("retrieve_checkout_session", session_id))
        }

        async fn update_customer_metadata(
            &self,
            customer_id: &str,
            metadata: HashMap<String, String>,
        ) -> ProviderResult<()> {
            let mut state = self.state.write().unwrap();
            if state.fail_metadata {
                return Err(unavailable("update_customer_metadata"));
            }
            state
                .customer_metadata
                .entry(customer_id.to_string())
                .or_default()
                .extend(metadata);
            Ok(())
        }

        async fn update_subscription_metadata(
            &self,
            subscription_id: &str,
            metadata: HashMap<String, String>,
        ) -> ProviderResult<()> {
            let mut state = self.state.write().unwrap();
            if state.fail_metadata {
                return Err(unavailable("update_subscription_metadata"));
            }
            state
                .subscription_metadata
                .entry(subscription_id.to_string())
                .or_default()
                .extend(metadata);
            Ok(())
        }

        async fn update_checkout_session_metadata(
            &self,
            session_id: &str,
            metadata: HashMap<String, String>,
        ) -> ProviderResult<()> {
            let mut state = self.state.write().unwrap();
            if state.fail_metadata {
                return Err(unavailable("update_checkout_session_metadata"));
            }
            match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.metadata.extend(metadata);
                    Ok(())
                }
                None => Err(missing("update_checkout_session_metadata", session_id)),
            }
        }
    }

    /// Build an active subscription fixture.
    pub fn subscription(
        id: &str,
        customer_id: &str,
        price_id: &str,
        amount: i64,
        created: DateTime<Utc>,
    ) -> BillingSubscription {
        BillingSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: "active".to_string(),
            price_id: price_id.to_string(),
            amount,
            period_start: created,
            period_end: created + chrono::Duration::days(30),
            created,
            cancel_at_period_end: false,
        }
    }
}
