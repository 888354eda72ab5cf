//! Scheduled reconciliation jobs
//!
//! Jobs implement [`ScheduledJob`](crate::traits::job::ScheduledJob) and are
//! driven by [`JobScheduler`] on an interval, or triggered on demand over HTTP.
//! The override expiry job lives with the overrides in
//! [`entitlements`](crate::entitlements::OverrideExpiryMonitor).

mod config;
mod scheduler;
mod sweep;

pub use config::JobsConfig;
pub use scheduler::{run_job, JobScheduler};
pub use sweep::{ReconciliationSweep, SweepReport};
