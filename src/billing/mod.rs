//! Billing provider integration.
//!
//! [`BillingClient`] is the raw provider seam, [`BillingGateway`] the adapter
//! the rest of the crate uses, and [`PlanCatalog`] maps provider prices to
//! local plan slugs.
//!
//! # Features
//!
//! - `stripe` - Enables [`LiveStripeClient`]

pub mod client;
pub mod error;
pub mod gateway;
#[cfg(feature = "stripe")]
pub mod live_client;
pub mod plans;

pub use client::{BillingClient, BillingSubscription, CheckoutSession, CheckoutStatus, ProviderResult};
pub use error::ProviderError;
pub use gateway::{sort_canonical_first, BillingGateway};
#[cfg(feature = "stripe")]
pub use live_client::{InvalidApiKeyError, LiveStripeClient, LiveStripeClientConfig};
pub use plans::{PlanCatalog, PlanDefinition};

#[cfg(any(test, feature = "test-support"))]
pub use client::test::MockBillingClient;
