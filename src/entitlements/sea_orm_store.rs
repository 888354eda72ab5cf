//! SeaORM-backed entitlement storage.
//!
//! ```rust,ignore
//! use plansync::entitlements::SeaOrmEntitlementStore;
//!
//! let store = SeaOrmEntitlementStore::new(db.clone(), "free");
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use super::storage::{
    cancelled_record, BillingProfile, EntitlementStore, LocalSubscriptionRecord,
    LocalSubscriptionStatus, NewOverride, SubscriptionOverride, UpsertOutcome, UpsertSubscription,
};
use crate::error::{EntitlementError, Result};

mod entity {
    pub mod subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub plan_slug: String,
            pub status: String,
            pub starts_at: DateTimeWithTimeZone,
            pub expires_at: Option<DateTimeWithTimeZone>,
            pub billing_customer_id: Option<String>,
            pub subscribed: bool,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod subscription_override {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "subscription_overrides")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub user_id: String,
            pub plan_slug: String,
            pub expires_at: Option<DateTimeWithTimeZone>,
            pub reason: String,
            pub is_active: bool,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod plan {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "plans")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub slug: String,
            pub name: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod billing_profile {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "billing_profiles")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub email: String,
            pub full_name: Option<String>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{billing_profile, plan, subscription, subscription_override};

fn db_err(e: DbErr) -> EntitlementError {
    EntitlementError::storage(e.to_string())
}

fn to_record(model: subscription::Model) -> LocalSubscriptionRecord {
    LocalSubscriptionRecord {
        user_id: model.user_id,
        plan_slug: model.plan_slug,
        status: LocalSubscriptionStatus::parse(&model.status),
        starts_at: model.starts_at.with_timezone(&Utc),
        expires_at: model.expires_at.map(|at| at.with_timezone(&Utc)),
        billing_customer_id: model.billing_customer_id,
        subscribed: model.subscribed,
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

fn to_active_model(record: &LocalSubscriptionRecord) -> subscription::ActiveModel {
    subscription::ActiveModel {
        user_id: Set(record.user_id.clone()),
        plan_slug: Set(record.plan_slug.clone()),
        status: Set(record.status.as_str().to_string()),
        starts_at: Set(record.starts_at.fixed_offset()),
        expires_at: Set(record.expires_at.map(|at| at.fixed_offset())),
        billing_customer_id: Set(record.billing_customer_id.clone()),
        subscribed: Set(record.subscribed),
        updated_at: Set(record.updated_at.fixed_offset()),
    }
}

fn to_override(model: subscription_override::Model) -> SubscriptionOverride {
    SubscriptionOverride {
        id: model.id,
        user_id: model.user_id,
        plan_slug: model.plan_slug,
        expires_at: model.expires_at.map(|at| at.with_timezone(&Utc)),
        reason: model.reason,
        is_active: model.is_active,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

/// SeaORM implementation of [`EntitlementStore`].
#[derive(Clone)]
pub struct SeaOrmEntitlementStore {
    db: DatabaseConnection,
    free_plan: String,
}

impl SeaOrmEntitlementStore {
    pub fn new(db: DatabaseConnection, free_plan: impl Into<String>) -> Self {
        Self {
            db,
            free_plan: free_plan.into(),
        }
    }

    async fn plan_exists_in(txn: &DatabaseTransaction, slug: &str) -> Result<bool> {
        Ok(plan::Entity::find_by_id(slug.to_string())
            .one(txn)
            .await
            .map_err(db_err)?
            .is_some())
    }

    async fn lock_row(txn: &DatabaseTransaction, user_id: &str) -> Result<Option<LocalSubscriptionRecord>> {
        Ok(subscription::Entity::find_by_id(user_id.to_string())
            .lock_exclusive()
            .one(txn)
            .await
            .map_err(db_err)?
            .map(to_record))
    }

    async fn write_row(txn: &DatabaseTransaction, record: &LocalSubscriptionRecord) -> Result<()> {
        subscription::Entity::insert(to_active_model(record))
            .on_conflict(
                OnConflict::column(subscription::Column::UserId)
                    .update_columns([
                        subscription::Column::PlanSlug,
                        subscription::Column::Status,
                        subscription::Column::StartsAt,
                        subscription::Column::ExpiresAt,
                        subscription::Column::BillingCustomerId,
                        subscription::Column::Subscribed,
                        subscription::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(txn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for SeaOrmEntitlementStore {
    async fn get_billing_profile(&self, user_id: &str) -> Result<Option<BillingProfile>> {
        let model = billing_profile::Entity::find_by_id(user_id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(model.map(|m| BillingProfile {
            user_id: m.user_id,
            email: m.email,
            full_name: m.full_name,
        }))
    }

    async fn get_subscription(&self, user_id: &str) -> Result<Option<LocalSubscriptionRecord>> {
        let model = subscription::Entity::find_by_id(user_id.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(model.map(to_record))
    }

    async fn list_paid_subscriptions(&self) -> Result<Vec<LocalSubscriptionRecord>> {
        let models = subscription::Entity::find()
            .filter(subscription::Column::PlanSlug.ne(self.free_plan.clone()))
            .order_by_asc(subscription::Column::UserId)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Ok(models.into_iter().map(to_record).collect())
    }

    async fn upsert_subscription(&self, upsert: &UpsertSubscription) -> Result<UpsertOutcome> {
        let txn = self.db.begin().await.map_err(db_err)?;

        if !Self::plan_exists_in(&txn, &upsert.plan_slug).await? {
            txn.rollback().await.map_err(db_err)?;
            return Err(EntitlementError::configuration(format!(
                "plan '{}' not found",
                upsert.plan_slug
            )));
        }

        let existing = Self::lock_row(&txn, &upsert.user_id).await?;
        if let Some(existing) = existing.as_ref().filter(|e| upsert.matches(e)) {
            let record = existing.clone();
            txn.commit().await.map_err(db_err)?;
            tracing::debug!(user_id = %upsert.user_id, "subscription already up to date");
            return Ok(UpsertOutcome {
                record,
                changed: false,
            });
        }

        let record = upsert.apply(existing.as_ref(), Utc::now());
        Self::write_row(&txn, &record).await?;
        txn.commit().await.map_err(db_err)?;

        tracing::debug!(
            user_id = %record.user_id,
            plan = %record.plan_slug,
            status = %record.status,
            "subscription upserted"
        );
        Ok(UpsertOutcome {
            record,
            changed: true,
        })
    }

    async fn cancel_subscription(&self, user_id: &str, immediate: bool) -> Result<LocalSubscriptionRecord> {
        let txn = self.db.begin().await.map_err(db_err)?;

        if !Self::plan_exists_in(&txn, &self.free_plan).await? {
            txn.rollback().await.map_err(db_err)?;
            return Err(EntitlementError::configuration("free plan not found"));
        }

        let existing = Self::lock_row(&txn, user_id).await?;
        let record = cancelled_record(existing, user_id, &self.free_plan, immediate, Utc::now());
        Self::write_row(&txn, &record).await?;
        txn.commit().await.map_err(db_err)?;

        tracing::debug!(user_id = %user_id, immediate, status = %record.status, "subscription cancelled");
        Ok(record)
    }

    async fn get_active_override(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionOverride>> {
        let model = subscription_override::Entity::find()
            .filter(subscription_override::Column::UserId.eq(user_id))
            .filter(subscription_override::Column::IsActive.eq(true))
            .filter(
                subscription_override::Column::ExpiresAt
                    .is_null()
                    .or(subscription_override::Column::ExpiresAt.gt(now.fixed_offset())),
            )
            .order_by_desc(subscription_override::Column::CreatedAt)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(model.map(to_override))
    }

    async fn create_override(&self, new: &NewOverride) -> Result<SubscriptionOverride> {
        let txn = self.db.begin().await.map_err(db_err)?;

        if !Self::plan_exists_in(&txn, &new.plan_slug).await? {
            txn.rollback().await.map_err(db_err)?;
            return Err(EntitlementError::configuration(format!(
                "plan '{}' not found",
                new.plan_slug
            )));
        }

        subscription_override::Entity::update_many()
            .col_expr(subscription_override::Column::IsActive, Expr::value(false))
            .filter(subscription_override::Column::UserId.eq(new.user_id.as_str()))
            .filter(subscription_override::Column::IsActive.eq(true))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        let created = SubscriptionOverride {
            id: Uuid::new_v4(),
            user_id: new.user_id.clone(),
            plan_slug: new.plan_slug.clone(),
            expires_at: new.expires_at,
            reason: new.reason.clone(),
            is_active: true,
            created_at: Utc::now(),
        };
        subscription_override::Entity::insert(subscription_override::ActiveModel {
            id: Set(created.id),
            user_id: Set(created.user_id.clone()),
            plan_slug: Set(created.plan_slug.clone()),
            expires_at: Set(created.expires_at.map(|at| at.fixed_offset())),
            reason: Set(created.reason.clone()),
            is_active: Set(true),
            created_at: Set(created.created_at.fixed_offset()),
        })
        .exec_without_returning(&txn)
        .await
        .map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;
        tracing::debug!(user_id = %created.user_id, override_id = %created.id, "override created");
        Ok(created)
    }

    async fn deactivate_override(&self, override_id: Uuid) -> Result<bool> {
        let result = subscription_override::Entity::update_many()
            .col_expr(subscription_override::Column::IsActive, Expr::value(false))
            .filter(subscription_override::Column::Id.eq(override_id))
            .filter(subscription_override::Column::IsActive.eq(true))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected > 0)
    }

    async fn deactivate_user_overrides(&self, user_id: &str) -> Result<u64> {
        let result = subscription_override::Entity::update_many()
            .col_expr(subscription_override::Column::IsActive, Expr::value(false))
            .filter(subscription_override::Column::UserId.eq(user_id))
            .filter(subscription_override::Column::IsActive.eq(true))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected)
    }

    async fn list_expired_overrides(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionOverride>> {
        let models = subscription_override::Entity::find()
            .filter(subscription_override::Column::IsActive.eq(true))
            .filter(subscription_override::Column::ExpiresAt.lt(now.fixed_offset()))
            .order_by_asc(subscription_override::Column::ExpiresAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Ok(models.into_iter().map(to_override).collect())
    }

    async fn plan_exists(&self, plan_slug: &str) -> Result<bool> {
        Ok(plan::Entity::find_by_id(plan_slug.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn brasilia() -> FixedOffset {
        FixedOffset::west_opt(3 * 3600).unwrap()
    }

    fn subscription_model(status: &str) -> subscription::Model {
        let tz = brasilia();
        subscription::Model {
            user_id: "u1".to_string(),
            plan_slug: "gestao".to_string(),
            status: status.to_string(),
            starts_at: tz.with_ymd_and_hms(2025, 1, 1, 21, 0, 0).unwrap(),
            expires_at: Some(tz.with_ymd_and_hms(2025, 1, 31, 21, 0, 0).unwrap()),
            billing_customer_id: Some("cus_1".to_string()),
            subscribed: true,
            updated_at: tz.with_ymd_and_hms(2025, 1, 1, 21, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_model_to_record_normalizes_to_utc() {
        let record = to_record(subscription_model("pending_cancellation"));

        assert_eq!(record.user_id, "u1");
        assert_eq!(record.plan_slug, "gestao");
        assert_eq!(record.status, LocalSubscriptionStatus::PendingCancellation);
        // 21:00 at -03:00 is midnight UTC the next day
        assert_eq!(record.starts_at, Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(
            record.expires_at,
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_1"));
        assert!(record.subscribed);
    }

    #[test]
    fn test_stored_status_strings() {
        let status = |s: &str| to_record(subscription_model(s)).status;
        assert_eq!(status("active"), LocalSubscriptionStatus::Active);
        assert_eq!(status("canceled"), LocalSubscriptionStatus::Canceled);
        assert_eq!(status("cancelled"), LocalSubscriptionStatus::Canceled);
        assert_eq!(status("inactive"), LocalSubscriptionStatus::Inactive);
        assert_eq!(status("paused"), LocalSubscriptionStatus::Inactive);
    }

    #[test]
    fn test_record_to_active_model() {
        let record = to_record(subscription_model("pending_cancellation"));
        let active = to_active_model(&record);

        assert!(matches!(active.user_id, Set(ref id) if id == "u1"));
        assert!(matches!(active.status, Set(ref s) if s == "pending_cancellation"));
        assert!(matches!(active.subscribed, Set(true)));
        match active.expires_at {
            Set(Some(at)) => {
                assert_eq!(at.offset().local_minus_utc(), 0);
                assert_eq!(at.with_timezone(&Utc), record.expires_at.unwrap());
            }
            _ => panic!("expiry not set"),
        }
    }

    #[test]
    fn test_active_model_round_trips_without_expiry() {
        let mut model = subscription_model("inactive");
        model.expires_at = None;
        model.subscribed = false;
        let record = to_record(model);
        assert_eq!(record.expires_at, None);

        let active = to_active_model(&record);
        assert!(matches!(active.expires_at, Set(None)));
        assert!(matches!(active.subscribed, Set(false)));
    }

    #[test]
    fn test_model_to_override() {
        let tz = brasilia();
        let id = Uuid::new_v4();
        let model = subscription_override::Model {
            id,
            user_id: "u1".to_string(),
            plan_slug: "psi_regular".to_string(),
            expires_at: Some(tz.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()),
            reason: "support trial".to_string(),
            is_active: true,
            created_at: tz.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap(),
        };

        let item = to_override(model);
        assert_eq!(item.id, id);
        assert_eq!(item.plan_slug, "psi_regular");
        assert_eq!(item.reason, "support trial");
        assert!(item.is_active);
        let expires_at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(item.expires_at, Some(expires_at));
        assert!(item.is_effective_at(expires_at - chrono::Duration::seconds(1)));
        assert!(item.is_expired_at(expires_at + chrono::Duration::seconds(1)));
    }
}
