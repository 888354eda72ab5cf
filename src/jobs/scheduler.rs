//! Interval scheduler for reconciliation jobs
//!
//! Each job gets its own task ticking on a `tokio::time::interval`. Missed
//! ticks are skipped rather than bunched up. Overlapping runs of the same job
//! across replicas are allowed since every job only issues idempotent writes.

use crate::error::Result;
use crate::traits::job::ScheduledJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs scheduled jobs until shut down
pub struct JobScheduler {
    tasks: Vec<JoinHandle<()>>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            shutdown_txs: Vec::new(),
        }
    }

    /// Start running `job` every `period`. The first run happens after one period.
    pub fn schedule(&mut self, job: Arc<dyn ScheduledJob>, period: Duration) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let name = job.name();
            tracing::info!(target: "plansync::jobs", job = name, period_secs = period.as_secs(), "Job scheduled");

            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        // Failures are logged by run_job; the next tick retries.
                        let _ = run_job(job.as_ref()).await;
                    }
                }
            }

            tracing::info!(target: "plansync::jobs", job = name, "Job stopped");
        });

        self.tasks.push(handle);
        self.shutdown_txs.push(shutdown_tx);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop all jobs, waiting for any run in progress to finish
    pub async fn shutdown(self) {
        tracing::info!(target: "plansync::jobs", "Shutting down job scheduler...");

        for shutdown_tx in self.shutdown_txs {
            let _ = shutdown_tx.send(()).await;
        }

        for task in self.tasks {
            let _ = task.await;
        }

        tracing::info!(target: "plansync::jobs", "Job scheduler shut down");
    }
}

/// Run one pass of `job`, logging its summary or failure.
pub async fn run_job(job: &dyn ScheduledJob) -> Result<serde_json::Value> {
    tracing::debug!(target: "plansync::jobs", job = job.name(), "Running job");
    let result = job.run().await;
    match &result {
        Ok(summary) => {
            tracing::info!(target: "plansync::jobs", job = job.name(), summary = %summary, "Job completed");
        }
        Err(e) => {
            tracing::error!(target: "plansync::jobs", job = job.name(), error = %e, "Job failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EntitlementError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> Result<serde_json::Value> {
            let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(EntitlementError::storage("down"));
            }
            Ok(serde_json::json!({ "runs": runs }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_ticking() {
        let job = Arc::new(CountingJob {
            fail: true,
            ..Default::default()
        });
        let mut scheduler = JobScheduler::new();
        scheduler.schedule(job.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval_until_shutdown() {
        let job = Arc::new(CountingJob::default());
        let mut scheduler = JobScheduler::new();
        scheduler.schedule(job.clone(), Duration::from_secs(60));
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_job_keeps_error_category() {
        let job = CountingJob {
            fail: true,
            ..Default::default()
        };
        assert!(matches!(run_job(&job).await, Err(EntitlementError::Storage(_))));
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        let ok = CountingJob::default();
        assert_eq!(run_job(&ok).await.unwrap()["runs"], 1);
    }
}
