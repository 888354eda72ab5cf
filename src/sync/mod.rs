//! Reconciliation between the billing provider and the local store.
//!
//! - [`SyncEngine`] performs one user's external check and idempotent upsert
//! - [`SyncCoordinator`] debounces, deduplicates and caches sync requests per user
//! - [`DuplicateSubscriptionResolver`] cancels all but one active subscription
//! - [`CancellationCoordinator`] cancels at the provider and then locally
//! - [`CheckoutLinker`] tags a completed checkout with the local user

pub mod cancellation;
pub mod checkout;
pub mod coordinator;
pub mod duplicates;
pub mod engine;

pub use cancellation::{CancellationCoordinator, CancellationReport};
pub use checkout::{CheckoutLink, CheckoutLinker};
pub use coordinator::{SyncCoordinator, SyncOutcome, SyncRegistry, SyncStatus};
pub use duplicates::{DuplicateResolution, DuplicateSubscriptionResolver, FailedCancellation};
pub use engine::{SyncEngine, SyncMode, SyncReport};
