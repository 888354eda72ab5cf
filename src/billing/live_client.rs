//! Live Stripe client.
//!
//! One provider request per call, bounded by a timeout. Nothing is retried
//! here; callers decide whether a failure is counted, surfaced or ignored.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{BillingClient, BillingSubscription, CheckoutSession, CheckoutStatus, ProviderResult};
use super::error::ProviderError;
use crate::utils::get_env_with_prefix;

/// Configuration for the live Stripe client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

impl LiveStripeClientConfig {
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = get_env_with_prefix("STRIPE_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse() {
                config.timeout_seconds = seconds;
            }
        }
        config
    }
}

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

impl From<InvalidApiKeyError> for crate::error::EntitlementError {
    fn from(err: InvalidApiKeyError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Accepts `sk_test_`, `sk_live_`, `rk_test_` and `rk_live_` keys.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        });
    }

    Ok(())
}

fn parse_id<T: std::str::FromStr>(kind: &str, id: &str, operation: &str) -> ProviderResult<T> {
    id.parse()
        .map_err(|_| ProviderError::new(operation, format!("Invalid {} ID: {}", kind, id)).with_status(400))
}

fn timestamp(ts: stripe::Timestamp, operation: &str) -> ProviderResult<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| ProviderError::new(operation, format!("Invalid timestamp: {}", ts)))
}

/// Live Stripe client for production use.
///
/// ```rust,ignore
/// use plansync::billing::{BillingGateway, LiveStripeClient, LiveStripeClientConfig, PlanCatalog};
///
/// let client = LiveStripeClient::new(api_key, LiveStripeClientConfig::default())?;
/// let gateway = BillingGateway::new(Arc::new(client), Arc::new(PlanCatalog::default()));
/// ```
#[derive(Clone)]
pub struct LiveStripeClient {
    client: stripe::Client,
    config: LiveStripeClientConfig,
    api_key: SecretString,
}

impl LiveStripeClient {
    /// The key is validated and never shows up in debug output.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeClientConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "plansync".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Build from `STRIPE_SECRET_KEY` and `STRIPE_TIMEOUT_SECONDS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or malformed.
    pub fn from_env() -> std::result::Result<Self, InvalidApiKeyError> {
        let key = get_env_with_prefix("STRIPE_SECRET_KEY").ok_or_else(|| InvalidApiKeyError {
            reason: "STRIPE_SECRET_KEY is not set".to_string(),
        })?;
        Self::new(SecretString::from(key), LiveStripeClientConfig::from_env())
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Mutating calls carry an idempotency key so a caller-level retry is safe.
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = format!("{}_{}", operation, uuid::Uuid::new_v4());
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> ProviderResult<T>
    where
        Fut: Future<Output = std::result::Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let err = map_stripe_error(e, operation);
                tracing::warn!(
                    target: "plansync::billing::stripe",
                    operation = operation,
                    http_status = err.http_status,
                    error = %err,
                    "Stripe API call failed"
                );
                Err(err)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    target: "plansync::billing::stripe",
                    operation = operation,
                    timeout_seconds = self.config.timeout_seconds,
                    "Stripe API request timed out"
                );
                Err(ProviderError::timeout(operation))
            }
        }
    }
}

impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> ProviderError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            let mut err = ProviderError::new(operation, message).with_status(request_error.http_status);
            if let Some(code) = request_error.code.as_ref() {
                err = err.with_code(format!("{code:?}"));
            }
            err
        }
        stripe::StripeError::Timeout => ProviderError::timeout(operation),
        stripe::StripeError::ClientError(msg) => {
            ProviderError::new(operation, format!("HTTP client error: {msg}"))
        }
        other => ProviderError::new(operation, other.to_string()).with_status(500),
    }
}

fn map_subscription(sub: stripe::Subscription, operation: &str) -> ProviderResult<BillingSubscription> {
    let status = match sub.status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
        stripe::SubscriptionStatus::Paused => "paused",
    };

    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };

    // The first item carries the plan price
    let price = sub.items.data.first().and_then(|item| item.price.as_ref());
    let (price_id, amount) = match price {
        Some(price) => (price.id.to_string(), price.unit_amount.unwrap_or(0)),
        None => {
            return Err(ProviderError::new(
                operation,
                format!("Subscription {} has no priced item", sub.id),
            ))
        }
    };

    Ok(BillingSubscription {
        id: sub.id.to_string(),
        customer_id,
        status: status.to_string(),
        price_id,
        amount,
        period_start: timestamp(sub.current_period_start, operation)?,
        period_end: timestamp(sub.current_period_end, operation)?,
        created: timestamp(sub.created, operation)?,
        cancel_at_period_end: sub.cancel_at_period_end,
    })
}

#[derive(Serialize)]
struct MetadataForm {
    metadata: HashMap<String, String>,
}

#[async_trait]
impl BillingClient for LiveStripeClient {
    async fn find_customer_by_email(&self, email: &str) -> ProviderResult<Option<String>> {
        let mut params = stripe::ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = self
            .call("find_customer_by_email", stripe::Customer::list(&self.client, &params))
            .await?;
        Ok(customers.data.into_iter().next().map(|c| c.id.to_string()))
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> ProviderResult<Vec<BillingSubscription>> {
        const OP: &str = "list_active_subscriptions";
        let customer: stripe::CustomerId = parse_id("customer", customer_id, OP)?;

        let mut params = stripe::ListSubscriptions::new();
        params.customer = Some(customer);
        params.status = Some(stripe::SubscriptionStatusFilter::Active);
        params.limit = Some(100);

        let subscriptions = self
            .call(OP, stripe::Subscription::list(&self.client, &params))
            .await?;
        subscriptions
            .data
            .into_iter()
            .map(|sub| map_subscription(sub, OP))
            .collect()
    }

    async fn cancel_subscription_now(&self, subscription_id: &str) -> ProviderResult<()> {
        const OP: &str = "cancel_subscription_now";
        let sub_id: stripe::SubscriptionId = parse_id("subscription", subscription_id, OP)?;

        self.call(
            OP,
            stripe::Subscription::cancel(&self.client, &sub_id, stripe::CancelSubscription::default()),
        )
        .await?;
        Ok(())
    }

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> ProviderResult<()> {
        const OP: &str = "cancel_subscription_at_period_end";
        let client = self.idempotent_client(OP);
        let sub_id: stripe::SubscriptionId = parse_id("subscription", subscription_id, OP)?;

        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        self.call(OP, stripe::Subscription::update(&client, &sub_id, params))
            .await?;
        Ok(())
    }

    async fn retrieve_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSession> {
        const OP: &str = "retrieve_checkout_session";
        let id: stripe::CheckoutSessionId = parse_id("checkout session", session_id, OP)?;

        let session = self
            .call(OP, stripe::CheckoutSession::retrieve(&self.client, &id, &[]))
            .await?;

        let status = match session.status {
            Some(stripe::CheckoutSessionStatus::Complete) => CheckoutStatus::Complete,
            Some(stripe::CheckoutSessionStatus::Expired) => CheckoutStatus::Expired,
            _ => CheckoutStatus::Open,
        };

        Ok(CheckoutSession {
            id: session.id.to_string(),
            status,
            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
            subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
            metadata: session.metadata.clone().unwrap_or_default(),
        })
    }

    async fn update_customer_metadata(
        &self,
        customer_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()> {
        const OP: &str = "update_customer_metadata";
        let client = self.idempotent_client(OP);
        let id: stripe::CustomerId = parse_id("customer", customer_id, OP)?;

        let mut params = stripe::UpdateCustomer::new();
        params.metadata = Some(metadata);

        self.call(OP, stripe::Customer::update(&client, &id, params))
            .await?;
        Ok(())
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()> {
        const OP: &str = "update_subscription_metadata";
        let client = self.idempotent_client(OP);
        let id: stripe::SubscriptionId = parse_id("subscription", subscription_id, OP)?;

        let mut params = stripe::UpdateSubscription::new();
        params.metadata = Some(metadata);

        self.call(OP, stripe::Subscription::update(&client, &id, params))
            .await?;
        Ok(())
    }

    async fn update_checkout_session_metadata(
        &self,
        session_id: &str,
        metadata: HashMap<String, String>,
    ) -> ProviderResult<()> {
        const OP: &str = "update_checkout_session_metadata";
        let client = self.idempotent_client(OP);
        let path = format!("/checkout/sessions/{}", session_id);

        // Typed params lack a session update; post the form directly
        self.call(
            OP,
            client.post_form::<stripe::CheckoutSession, _>(&path, MetadataForm { metadata }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk_test_1234567890abcdef").is_ok());
        assert!(validate_api_key("rk_live_1234567890abcdef").is_ok());
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("sk_test_short").is_err());
        assert!(validate_api_key("pk_test_1234567890abcdef").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let client = LiveStripeClient::new(
            SecretString::from("sk_test_1234567890abcdefghij".to_string()),
            LiveStripeClientConfig::default(),
        )
        .unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("sk_test_1234567890abcdefghij"));
        assert!(debug.contains("is_test_mode: true"));
    }

    #[test]
    fn test_invalid_id_is_client_error() {
        let err = parse_id::<stripe::CustomerId>("customer", "not-a-customer", "op").unwrap_err();
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }
}
