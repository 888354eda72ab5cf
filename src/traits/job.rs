//! Scheduled job trait
//!
//! Reconciliation jobs take no arguments. They are triggered on an interval by
//! [`JobScheduler`](crate::jobs::JobScheduler) or on demand over HTTP, and
//! return a JSON summary of what they did.

use crate::error::Result;
use async_trait::async_trait;

/// An argument-less job that may run concurrently with itself.
///
/// Implementations must only perform idempotent writes so that overlapping
/// runs converge to the same end state.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Stable identifier used in logs and routes (e.g. `reconciliation_sweep`)
    fn name(&self) -> &'static str;

    /// Run one pass and return its summary
    async fn run(&self) -> Result<serde_json::Value>;
}
