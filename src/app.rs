use std::sync::Arc;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::billing::{BillingClient, BillingGateway, PlanCatalog};
use crate::config::Config;
use crate::entitlements::{
    EntitlementResolver, EntitlementStore, OverrideExpiryMonitor, OverrideManager,
};
use crate::error::{EntitlementError, Result};
use crate::jobs::{JobScheduler, ReconciliationSweep};
use crate::sync::{
    CancellationCoordinator, CheckoutLinker, DuplicateSubscriptionResolver, SyncEngine,
    SyncRegistry,
};
use crate::traits::cache::Cache;

/// Shared state holding every reconciliation component
///
/// All components share one store, one gateway and one read cache, so a
/// write through any of them is visible to the resolver after invalidation.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub cache: Arc<dyn Cache>,
    pub resolver: EntitlementResolver,
    pub syncs: SyncRegistry,
    pub overrides: OverrideManager,
    pub duplicates: DuplicateSubscriptionResolver,
    pub cancellation: CancellationCoordinator,
    pub checkout: CheckoutLinker,
    pub sweep: Arc<ReconciliationSweep>,
    pub override_expiry: Arc<OverrideExpiryMonitor>,
}

impl AppContext {
    /// Builder pattern for constructing AppContext
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Schedule the sweep and override expiry jobs if jobs are enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_jobs(&self) -> JobScheduler {
        let mut scheduler = JobScheduler::new();
        let jobs = &self.config.jobs;
        if jobs.enabled {
            scheduler.schedule(self.sweep.clone(), jobs.sweep_interval());
            scheduler.schedule(self.override_expiry.clone(), jobs.override_expiry_interval());
        } else {
            tracing::info!(target: "plansync::jobs", "Scheduled jobs disabled");
        }
        scheduler
    }
}

/// Builder for AppContext with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    config: Config,
    store: Option<Arc<dyn EntitlementStore>>,
    billing: Option<Arc<dyn BillingClient>>,
    cache: Option<Arc<dyn Cache>>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: None,
            billing: None,
            cache: None,
            audit: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the entitlement store (required)
    pub fn with_store(mut self, store: Arc<dyn EntitlementStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the billing provider client (required)
    pub fn with_billing_client(mut self, client: Arc<dyn BillingClient>) -> Self {
        self.billing = Some(client);
        self
    }

    /// Set the read cache. Defaults to the backend named in the cache config.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the audit logger. Defaults to [`TracingAuditLogger`].
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sync coordinators are spawned lazily on a user's first sync request,
    /// so those requests must run inside a tokio runtime.
    pub fn build(self) -> Result<AppContext> {
        let store = self
            .store
            .ok_or_else(|| EntitlementError::configuration("entitlement store not configured"))?;
        let billing = self
            .billing
            .ok_or_else(|| EntitlementError::configuration("billing client not configured"))?;
        let cache = self.cache.unwrap_or_else(|| self.config.cache.build());
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditLogger));

        let catalog = Arc::new(PlanCatalog::from_config(&self.config.plans));
        let gateway = BillingGateway::new(billing, catalog.clone());
        let engine = SyncEngine::new(store.clone(), gateway.clone());
        let syncs = SyncRegistry::new(engine, cache.clone(), self.config.sync.clone());

        let resolver = EntitlementResolver::new(
            store.clone(),
            cache.clone(),
            catalog,
            self.config.sync.cache_ttl(),
        );
        let override_expiry = OverrideExpiryMonitor::new(
            store.clone(),
            cache.clone(),
            Arc::new(syncs.clone()),
            audit.clone(),
        );

        Ok(AppContext {
            resolver,
            overrides: OverrideManager::new(store.clone(), cache.clone(), audit.clone()),
            duplicates: DuplicateSubscriptionResolver::new(
                store.clone(),
                gateway.clone(),
                cache.clone(),
                audit.clone(),
            ),
            cancellation: CancellationCoordinator::new(
                store.clone(),
                gateway.clone(),
                cache.clone(),
                audit.clone(),
            ),
            checkout: CheckoutLinker::new(store.clone(), gateway.clone(), audit.clone()),
            sweep: Arc::new(ReconciliationSweep::new(store, gateway, cache.clone(), audit)),
            override_expiry: Arc::new(override_expiry),
            syncs,
            cache,
            config: Arc::new(self.config),
        })
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
