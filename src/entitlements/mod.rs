//! Local entitlement state and the read path over it.

pub mod overrides;
pub mod resolver;
#[cfg(feature = "seaorm")]
pub mod sea_orm_store;
pub mod storage;

pub use overrides::{OverrideExpiryMonitor, OverrideExpiryReport, OverrideManager, ResyncTrigger};
pub use resolver::{EffectivePlan, EntitlementResolver, EntitlementSummary, PlanSource};
#[cfg(feature = "seaorm")]
pub use sea_orm_store::SeaOrmEntitlementStore;
pub use storage::{
    BillingProfile, EntitlementStore, LocalSubscriptionRecord, LocalSubscriptionStatus, NewOverride,
    SubscriptionOverride, UpsertOutcome, UpsertSubscription,
};

#[cfg(any(test, feature = "test-support"))]
pub use storage::test::InMemoryEntitlementStore;
