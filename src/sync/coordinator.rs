//! Per-user sync actor.
//!
//! Each user gets one task that owns the in-flight flag, the result cache and
//! the debounce deadline. Callers talk to it through a [`SyncCoordinator`]
//! handle, so no state is shared between users or sessions.
//!
//! Request handling:
//!
//! 1. While a sync is in flight every request is rejected with
//!    [`EntitlementError::SyncInProgress`]. Nothing is queued.
//! 2. A non-forced request is answered from the cache if the last successful
//!    result is younger than the cache TTL.
//! 3. A non-forced request otherwise (re)starts the debounce window. When the
//!    window closes one sync runs and every caller in the burst gets its result.
//!    A forced request runs at once and absorbs any callers still waiting on
//!    the debounce window.
//! 4. On success the result is cached and the user's read caches are
//!    invalidated. The in-flight flag is cleared whatever the outcome,
//!    including a panicking sync task.
//!
//! An actor with nothing running or pending for the configured idle timeout
//! closes its channel, answers whatever was already queued and exits. The
//! [`SyncRegistry`] then drops its entry and spawns a fresh actor on next use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};

use super::engine::{SyncEngine, SyncReport};
use crate::cache::CacheKeys;
use crate::config::SyncConfig;
use crate::entitlements::ResyncTrigger;
use crate::error::{EntitlementError, Result};
use crate::traits::cache::Cache;

/// Result of one `request_sync` call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    failure: Option<Arc<EntitlementError>>,
}

impl SyncOutcome {
    fn succeeded(report: SyncReport) -> Self {
        Self {
            success: true,
            data: Some(report),
            error: None,
            failure: None,
        }
    }

    fn failed(err: Arc<EntitlementError>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            failure: Some(err),
        }
    }

    fn rejected(err: EntitlementError) -> Self {
        Self::failed(Arc::new(err))
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.failure.as_deref(), Some(EntitlementError::SyncInProgress))
    }

    pub fn into_result(self) -> Result<SyncReport> {
        match (self.data, self.failure) {
            (Some(report), _) => Ok(report),
            (None, Some(err)) => Err(Arc::try_unwrap(err).unwrap_or_else(|shared| shared.duplicate())),
            (None, None) => Err(EntitlementError::internal("sync produced no result")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: String,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub has_cached_result: bool,
    pub pending_requests: usize,
}

enum Command {
    Request {
        force: bool,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
}

type OnStop = Box<dyn FnOnce() + Send>;

/// Handle to one user's sync actor. Cheap to clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    user_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl SyncCoordinator {
    /// Spawn the actor for `user_id`. It stops once every handle is dropped
    /// or after sitting idle for the configured timeout.
    pub fn spawn(
        user_id: impl Into<String>,
        engine: SyncEngine,
        cache: Arc<dyn Cache>,
        config: &SyncConfig,
    ) -> Self {
        Self::spawn_inner(user_id.into(), engine, cache, config, None)
    }

    fn spawn_inner(
        user_id: String,
        engine: SyncEngine,
        cache: Arc<dyn Cache>,
        config: &SyncConfig,
        on_stop: Option<OnStop>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let actor = SyncActor {
            user_id: user_id.clone(),
            engine,
            cache,
            debounce: config.debounce(),
            cache_ttl: config.cache_ttl(),
            idle_timeout: config.idle_timeout(),
            idle_since: Instant::now(),
            on_stop,
            rx,
            running: None,
            in_flight: Vec::new(),
            pending: Vec::new(),
            deadline: None,
            cached: None,
            last_sync_time: None,
            last_error: None,
        };
        tokio::spawn(actor.run());

        Self {
            user_id: user_id.into(),
            tx,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the actor behind this handle has shut down.
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn request_sync(&self, force: bool) -> SyncOutcome {
        match self.submit(force).await {
            Some(rx) => receive(rx).await,
            None => SyncOutcome::rejected(EntitlementError::internal("sync coordinator stopped")),
        }
    }

    /// Queue a request. `None` if the actor no longer accepts commands.
    async fn submit(&self, force: bool) -> Option<oneshot::Receiver<SyncOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Request { force, reply }).await.ok()?;
        Some(rx)
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| EntitlementError::internal("sync coordinator stopped"))?;
        rx.await
            .map_err(|_| EntitlementError::internal("sync coordinator dropped the request"))
    }
}

async fn receive(rx: oneshot::Receiver<SyncOutcome>) -> SyncOutcome {
    rx.await.unwrap_or_else(|_| {
        SyncOutcome::rejected(EntitlementError::internal("sync coordinator dropped the request"))
    })
}

struct CachedResult {
    report: SyncReport,
    stored_at: Instant,
}

struct SyncActor {
    user_id: String,
    engine: SyncEngine,
    cache: Arc<dyn Cache>,
    debounce: Duration,
    cache_ttl: Duration,
    idle_timeout: Duration,
    idle_since: Instant,
    on_stop: Option<OnStop>,
    rx: mpsc::Receiver<Command>,
    /// The in-flight flag: `Some` while a sync task runs.
    running: Option<JoinHandle<Result<SyncReport>>>,
    in_flight: Vec<oneshot::Sender<SyncOutcome>>,
    pending: Vec<oneshot::Sender<SyncOutcome>>,
    deadline: Option<Instant>,
    cached: Option<CachedResult>,
    last_sync_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl SyncActor {
    async fn run(mut self) {
        tracing::debug!(target: "plansync::sync", user_id = %self.user_id, "Sync coordinator started");

        let mut open = true;
        loop {
            if !open && self.running.is_none() && self.deadline.is_none() {
                break;
            }
            let deadline = self.deadline;
            let idle = self.is_idle();
            let idle_at = self.idle_since + self.idle_timeout;
            tokio::select! {
                cmd = self.rx.recv(), if open => match cmd {
                    Some(cmd) => {
                        self.idle_since = Instant::now();
                        self.handle(cmd);
                    }
                    None => open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    let waiters = std::mem::take(&mut self.pending);
                    self.start(false, waiters);
                }
                result = join_running(&mut self.running), if self.running.is_some() => {
                    self.finish(result).await;
                    self.idle_since = Instant::now();
                }
                _ = sleep_until(idle_at), if open && idle => {
                    tracing::debug!(target: "plansync::sync", user_id = %self.user_id, "Sync coordinator idle, closing");
                    // Commands already queued are still received before `None`.
                    self.rx.close();
                }
            }
        }

        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
        tracing::debug!(target: "plansync::sync", user_id = %self.user_id, "Sync coordinator stopped");
    }

    fn is_idle(&self) -> bool {
        self.running.is_none() && self.deadline.is_none() && self.pending.is_empty()
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Request { force, reply } => {
                if self.running.is_some() {
                    tracing::debug!(target: "plansync::sync", user_id = %self.user_id, force, "Sync rejected, already in progress");
                    let _ = reply.send(SyncOutcome::rejected(EntitlementError::SyncInProgress));
                    return;
                }

                if force {
                    self.deadline = None;
                    let mut waiters = std::mem::take(&mut self.pending);
                    waiters.push(reply);
                    self.start(true, waiters);
                    return;
                }

                if let Some(report) = self.fresh_cached() {
                    let _ = reply.send(SyncOutcome::succeeded(report));
                    return;
                }

                self.pending.push(reply);
                self.deadline = Some(Instant::now() + self.debounce);
            }
        }
    }

    fn start(&mut self, force: bool, waiters: Vec<oneshot::Sender<SyncOutcome>>) {
        tracing::debug!(
            target: "plansync::sync",
            user_id = %self.user_id,
            force,
            waiters = waiters.len(),
            "Starting sync"
        );
        let engine = self.engine.clone();
        let user_id = self.user_id.clone();
        self.in_flight = waiters;
        self.running = Some(tokio::spawn(async move { engine.sync(&user_id, force).await }));
    }

    async fn finish(&mut self, result: std::result::Result<Result<SyncReport>, JoinError>) {
        self.running = None;
        let waiters = std::mem::take(&mut self.in_flight);

        let outcome = match result {
            Ok(Ok(report)) => {
                self.cached = Some(CachedResult {
                    report: report.clone(),
                    stored_at: Instant::now(),
                });
                self.last_sync_time = Some(Utc::now());
                self.last_error = None;
                CacheKeys::invalidate_user(self.cache.as_ref(), &self.user_id).await;
                tracing::info!(
                    target: "plansync::sync",
                    user_id = %self.user_id,
                    plan = %report.plan,
                    changed = report.changed,
                    "Sync completed"
                );
                SyncOutcome::succeeded(report)
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "plansync::sync", user_id = %self.user_id, error = %e, "Sync failed");
                self.last_error = Some(e.to_string());
                SyncOutcome::failed(Arc::new(e))
            }
            Err(join_err) => {
                tracing::error!(target: "plansync::sync", user_id = %self.user_id, error = %join_err, "Sync task aborted");
                let e = EntitlementError::internal(format!("sync task failed: {}", join_err));
                self.last_error = Some(e.to_string());
                SyncOutcome::failed(Arc::new(e))
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn fresh_cached(&self) -> Option<SyncReport> {
        self.cached
            .as_ref()
            .filter(|entry| entry.stored_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.report.clone())
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            user_id: self.user_id.clone(),
            is_syncing: self.running.is_some(),
            last_sync_time: self.last_sync_time,
            last_error: self.last_error.clone(),
            has_cached_result: self.fresh_cached().is_some(),
            pending_requests: self.pending.len(),
        }
    }
}

async fn join_running(
    running: &mut Option<JoinHandle<Result<SyncReport>>>,
) -> std::result::Result<Result<SyncReport>, JoinError> {
    match running {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// One coordinator per user, created on first use.
#[derive(Clone)]
pub struct SyncRegistry {
    engine: SyncEngine,
    cache: Arc<dyn Cache>,
    config: SyncConfig,
    coordinators: Arc<DashMap<String, SyncCoordinator>>,
}

impl SyncRegistry {
    pub fn new(engine: SyncEngine, cache: Arc<dyn Cache>, config: SyncConfig) -> Self {
        Self {
            engine,
            cache,
            config,
            coordinators: Arc::new(DashMap::new()),
        }
    }

    pub fn coordinator(&self, user_id: &str) -> SyncCoordinator {
        if let Some(existing) = self.coordinators.get(user_id) {
            if !existing.is_stopped() {
                return existing.clone();
            }
        }
        self.coordinators
            .entry(user_id.to_string())
            .and_modify(|c| {
                if c.is_stopped() {
                    *c = self.spawn(user_id);
                }
            })
            .or_insert_with(|| self.spawn(user_id))
            .clone()
    }

    /// The actor removes its own entry when it stops, unless a newer actor
    /// has already taken the slot.
    fn spawn(&self, user_id: &str) -> SyncCoordinator {
        let coordinators = Arc::downgrade(&self.coordinators);
        let key = user_id.to_string();
        let on_stop: OnStop = Box::new(move || {
            if let Some(coordinators) = coordinators.upgrade() {
                coordinators.remove_if(&key, |_, c| c.is_stopped());
            }
        });
        SyncCoordinator::spawn_inner(
            user_id.to_string(),
            self.engine.clone(),
            self.cache.clone(),
            &self.config,
            Some(on_stop),
        )
    }

    /// Send a request, retrying once on a fresh actor if the current one shut
    /// down between lookup and send.
    pub async fn request_sync(&self, user_id: &str, force: bool) -> SyncOutcome {
        for _ in 0..2 {
            if let Some(rx) = self.coordinator(user_id).submit(force).await {
                return receive(rx).await;
            }
        }
        SyncOutcome::rejected(EntitlementError::internal("sync coordinator stopped"))
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}

#[async_trait]
impl ResyncTrigger for SyncRegistry {
    async fn force_resync(&self, user_id: &str) -> Result<()> {
        self.request_sync(user_id, true).await.into_result().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::test::subscription;
    use crate::billing::{BillingGateway, MockBillingClient, PlanCatalog};
    use crate::cache::InMemoryCache;
    use crate::entitlements::{EntitlementStore, InMemoryEntitlementStore};
    use crate::traits::cache::CacheExt;
    use chrono::TimeZone;
    use futures::future::join_all;

    struct Fixture {
        client: Arc<MockBillingClient>,
        store: InMemoryEntitlementStore,
        cache: Arc<InMemoryCache>,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(MockBillingClient::new());
        let store = InMemoryEntitlementStore::new();
        store.seed_profile("u1", "ana@example.com");
        client.add_customer("ana@example.com", "cus_1");
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        client.add_subscription(subscription("sub_1", "cus_1", "price_a", 6900, t));
        Fixture {
            client,
            store,
            cache: Arc::new(InMemoryCache::new(100)),
        }
    }

    fn coordinator(f: &Fixture) -> SyncCoordinator {
        let engine = SyncEngine::new(
            Arc::new(f.store.clone()),
            BillingGateway::new(f.client.clone(), Arc::new(PlanCatalog::default())),
        );
        SyncCoordinator::spawn("u1", engine, f.cache.clone(), &SyncConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_sync() {
        let f = fixture();
        let coordinator = coordinator(&f);

        let outcomes = join_all((0..5).map(|_| coordinator.request_sync(false))).await;

        assert_eq!(f.client.subscription_list_calls(), 1);
        let first = outcomes[0].clone().into_result().unwrap();
        for outcome in outcomes {
            assert!(outcome.success);
            assert_eq!(outcome.data.as_ref(), Some(&first));
        }
        assert_eq!(first.plan, "gestao");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_ttl_then_refetched() {
        let f = fixture();
        let coordinator = coordinator(&f);

        assert!(coordinator.request_sync(false).await.success);
        assert_eq!(f.client.subscription_list_calls(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(coordinator.request_sync(false).await.success);
        assert_eq!(f.client.subscription_list_calls(), 1);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(coordinator.request_sync(false).await.success);
        assert_eq!(f.client.subscription_list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sync_rejected_while_in_flight() {
        let f = fixture();
        f.client.set_latency(Duration::from_secs(1));
        let coordinator = coordinator(&f);

        let (first, second) = tokio::join!(coordinator.request_sync(true), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coordinator.request_sync(true).await
        });

        assert!(first.success);
        assert!(!second.success);
        assert!(second.is_in_progress());
        assert_eq!(second.error.as_deref(), Some("sync already in progress"));
        assert!(matches!(second.into_result(), Err(EntitlementError::SyncInProgress)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_sync_absorbs_debounced_waiters() {
        let f = fixture();
        let coordinator = coordinator(&f);
        coordinator.request_sync(false).await.into_result().unwrap();
        assert_eq!(f.client.subscription_list_calls(), 1);
        tokio::time::advance(Duration::from_secs(31)).await;

        let (waiting, forced) = tokio::join!(coordinator.request_sync(false), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            coordinator.request_sync(true).await
        });

        assert!(waiting.success);
        assert!(forced.success);
        assert_eq!(waiting.data, forced.data);
        assert_eq!(f.client.subscription_list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_sync_bypasses_fresh_cache() {
        let f = fixture();
        let coordinator = coordinator(&f);
        coordinator.request_sync(false).await.into_result().unwrap();
        coordinator.request_sync(true).await.into_result().unwrap();
        assert_eq!(f.client.subscription_list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_recorded_and_flag_cleared() {
        let f = fixture();
        f.client.fail_customer_lookup("ana@example.com");
        let coordinator = coordinator(&f);

        let outcome = coordinator.request_sync(true).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.into_result(), Err(EntitlementError::Provider(_))));

        let status = coordinator.status().await.unwrap();
        assert!(!status.is_syncing);
        assert!(status.last_error.is_some());
        assert!(status.last_sync_time.is_none());

        // A later request runs rather than being rejected
        let again = coordinator.request_sync(true).await;
        assert!(!again.is_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_invalidates_read_caches() {
        let f = fixture();
        f.cache
            .set(&CacheKeys::effective_plan("u1"), &"free", None)
            .await
            .unwrap();
        let coordinator = coordinator(&f);

        coordinator.request_sync(true).await.into_result().unwrap();

        let cached: Option<String> = f.cache.get(&CacheKeys::effective_plan("u1")).await.unwrap();
        assert!(cached.is_none());
        let status = coordinator.status().await.unwrap();
        assert!(status.has_cached_result);
        assert!(status.last_sync_time.is_some());
    }

    fn registry(f: &Fixture, config: SyncConfig) -> SyncRegistry {
        let engine = SyncEngine::new(
            Arc::new(f.store.clone()),
            BillingGateway::new(f.client.clone(), Arc::new(PlanCatalog::default())),
        );
        SyncRegistry::new(engine, f.cache.clone(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_coordinators_leave_registry() {
        let f = fixture();
        for i in 0..50 {
            f.store.seed_profile(&format!("user_{}", i), &format!("user_{}@example.com", i));
        }
        let registry = registry(&f, SyncConfig::default());

        for i in 0..50 {
            registry.request_sync(&format!("user_{}", i), true).await;
        }
        assert_eq!(registry.len(), 50);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(registry.len(), 50);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_idle_shutdown_respawns() {
        let f = fixture();
        let registry = registry(&f, SyncConfig::default());

        let first = registry.coordinator("u1");
        assert!(registry.request_sync("u1", true).await.success);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(first.is_stopped());
        assert!(registry.is_empty());

        // A stale handle is rejected; the registry starts a new actor
        assert!(!first.request_sync(true).await.success);
        assert!(registry.request_sync("u1", true).await.success);
        assert_eq!(registry.len(), 1);
        assert_eq!(f.client.subscription_list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_idle_shutdown() {
        let f = fixture();
        let registry = registry(&f, SyncConfig::default());

        registry.request_sync("u1", true).await;
        tokio::time::sleep(Duration::from_secs(200)).await;
        registry.coordinator("u1").status().await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(registry.len(), 1);
        assert!(!registry.coordinator("u1").is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_reuses_coordinator() {
        let f = fixture();
        let registry = registry(&f, SyncConfig::default());

        registry.force_resync("u1").await.unwrap();
        registry.coordinator("u1");
        assert_eq!(registry.len(), 1);
        let record = f.store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.plan_slug, "gestao");
    }
}
