//! Plansync - entitlement reconciliation against a billing provider
//!
//! Keeps each user's local plan record convergent with the billing provider's
//! subscriptions, under concurrent requests, flaky provider calls, time-bounded
//! manual overrides and periodic background correction.
//!
//! # Components
//!
//! - **Billing**: [`BillingGateway`] over a pluggable [`BillingClient`], with
//!   price → plan mapping in [`PlanCatalog`]
//! - **Entitlements**: transactional [`EntitlementStore`], the cached
//!   [`EntitlementResolver`] read path, overrides and their expiry
//! - **Sync**: per-user [`SyncCoordinator`] actors, duplicate cleanup,
//!   cancellation and checkout linking
//! - **Jobs**: [`ReconciliationSweep`] and [`OverrideExpiryMonitor`] on a
//!   [`JobScheduler`]
//! - **HTTP**: Axum routes for the per-user and automation surfaces
//!
//! # Features
//!
//! - `stripe` - Live Stripe client via `async-stripe`
//! - `seaorm` - SQL entitlement store via `sea-orm`
//! - `test-support` - In-memory store, mock billing client and the
//!   [`testing`] helpers
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use plansync::{AppContext, ConfigBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> plansync::Result<()> {
//!     plansync::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let ctx = AppContext::builder()
//!         .with_config(config)
//!         .with_store(Arc::new(my_store))
//!         .with_billing_client(Arc::new(plansync::billing::LiveStripeClient::from_env()?))
//!         .build()?;
//!
//!     let _jobs = ctx.start_jobs();
//!     let app = plansync::http::router(ctx);
//!     // serve `app` behind your authentication layer
//!     Ok(())
//! }
//! ```

#![allow(async_fn_in_trait)] // async_trait macro handles Send/Sync bounds properly

mod app;
pub mod audit;
pub mod billing;
pub mod cache;
mod config;
pub mod entitlements;
mod error;
pub mod http;
pub mod jobs;
pub mod sync;
#[cfg(feature = "test-support")]
pub mod testing;
pub mod traits;
mod utils;

// Re-exports for public API
pub use app::{AppContext, AppContextBuilder};
pub use audit::{AuditEvent, AuditLogger, NoOpAuditLogger, TracingAuditLogger};
pub use billing::{BillingClient, BillingGateway, PlanCatalog, ProviderError};
pub use cache::{CacheKeys, InMemoryCache, NoOpCache};
pub use config::{Config, ConfigBuilder, LoggingConfig, PlanConfig, SyncConfig};
pub use entitlements::{
    EffectivePlan, EntitlementResolver, EntitlementStore, OverrideExpiryMonitor, OverrideManager,
    PlanSource,
};
pub use error::{EntitlementError, Result};
pub use http::{ApiResponse, AuthenticatedUser, CurrentUser, JsonResponse, RouteModule};
pub use jobs::{JobScheduler, JobsConfig, ReconciliationSweep};
pub use sync::{
    CancellationCoordinator, CheckoutLinker, DuplicateSubscriptionResolver, SyncCoordinator,
    SyncEngine, SyncOutcome, SyncRegistry,
};
pub use traits::cache::{Cache, CacheExt};
pub use traits::job::ScheduledJob;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (default `plansync=info`)
/// - `PLANSYNC_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plansync=info"));

    let json_logs = std::env::var("PLANSYNC_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from explicit logging configuration
pub fn init_tracing_with_config(config: &LoggingConfig) {
    let env_filter = EnvFilter::new(&config.level);

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
