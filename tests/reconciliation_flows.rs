//! End-to-end reconciliation flows over the in-memory store and mock provider.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures::future::join_all;
use plansync::audit::AuditEvent;
use plansync::entitlements::{EntitlementStore, LocalSubscriptionStatus, UpsertSubscription};
use plansync::sync::DuplicateResolution;
use plansync::testing::TestHarness;
use plansync::{EntitlementError, PlanSource};
use std::time::Duration;

fn created(day: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
}

async fn seed_paid(harness: &TestHarness, user_id: &str, plan: &str, customer_id: &str) {
    harness
        .store
        .upsert_subscription(
            &UpsertSubscription::new(user_id, plan)
                .customer(Some(customer_id.to_string()))
                .expires_at(Some(Utc::now() + ChronoDuration::days(20)))
                .subscribed(true),
        )
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn burst_of_requests_makes_one_provider_call() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 24900, created(1));

    let requests = (0..5).map(|_| harness.ctx.syncs.request_sync("u1", false));
    let outcomes = join_all(requests).await;

    assert_eq!(harness.billing.subscription_list_calls(), 1);
    let plans: Vec<_> = outcomes
        .into_iter()
        .map(|o| o.into_result().unwrap().plan)
        .collect();
    assert_eq!(plans, vec!["psi_regular"; 5]);
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "psi_regular");
}

#[tokio::test(start_paused = true)]
async fn successful_result_is_reused_for_thirty_seconds() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 6900, created(1));

    assert!(harness.ctx.syncs.request_sync("u1", false).await.success);
    assert_eq!(harness.billing.subscription_list_calls(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    let cached = harness.ctx.syncs.request_sync("u1", false).await;
    assert_eq!(cached.into_result().unwrap().plan, "gestao");
    assert_eq!(harness.billing.subscription_list_calls(), 1);

    tokio::time::advance(Duration::from_secs(21)).await;
    assert!(harness.ctx.syncs.request_sync("u1", false).await.success);
    assert_eq!(harness.billing.subscription_list_calls(), 2);
}

#[tokio::test]
async fn duplicates_keep_the_highest_amount() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 6900, created(1));
    harness.subscribe("sub_2", &customer_id, 24900, created(2));
    harness.subscribe("sub_3", &customer_id, 6900, created(3));

    let resolution = harness.ctx.duplicates.resolve("u1").await.unwrap();
    match resolution {
        DuplicateResolution::Resolved {
            kept,
            mut cancelled,
            failed,
            final_plan,
        } => {
            assert_eq!(kept, "sub_2");
            cancelled.sort();
            assert_eq!(cancelled, vec!["sub_1", "sub_3"]);
            assert!(failed.is_empty());
            assert_eq!(final_plan, "psi_regular");
        }
        other => panic!("unexpected resolution: {:?}", other),
    }

    let mut cancelled_now = harness.billing.cancelled_now();
    cancelled_now.sort();
    assert_eq!(cancelled_now, vec!["sub_1", "sub_3"]);
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "psi_regular");
    assert!(harness
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::DuplicatesCancelled { kept, .. } if kept == "sub_2")));

    // A second run finds a single subscription left
    let again = harness.ctx.duplicates.resolve("u1").await.unwrap();
    assert_eq!(again, DuplicateResolution::NothingToClean { active: 1 });
}

#[tokio::test]
async fn sweep_finishes_despite_one_failing_user() {
    let harness = TestHarness::new();
    let lapsed_customer = harness.customer("u_lapsed");
    let broken_customer = harness.customer("u_broken");
    seed_paid(&harness, "u_lapsed", "gestao", &lapsed_customer).await;
    seed_paid(&harness, "u_broken", "gestao", &broken_customer).await;
    harness.billing.fail_subscription_list(&broken_customer);

    let report = harness.ctx.sweep.run_once().await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.errors, 1);

    let lapsed = harness.store.get_subscription("u_lapsed").await.unwrap().unwrap();
    assert_eq!(lapsed.plan_slug, "free");
    assert!(!lapsed.subscribed);
    assert_eq!(lapsed.billing_customer_id, Some(lapsed_customer));

    let broken = harness.store.get_subscription("u_broken").await.unwrap().unwrap();
    assert_eq!(broken.plan_slug, "gestao");
}

#[tokio::test]
async fn sweep_converges_to_provider_plan() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    seed_paid(&harness, "u1", "gestao", &customer_id).await;
    harness.subscribe("sub_1", &customer_id, 24900, created(1));

    let first = harness.ctx.sweep.run_once().await.unwrap();
    assert_eq!(first.updated, 1);
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "psi_regular");

    let writes = harness.store.write_count();
    let second = harness.ctx.sweep.run_once().await.unwrap();
    assert_eq!(second.updated, 0);
    assert_eq!(harness.store.write_count(), writes);
}

#[tokio::test]
async fn override_takes_precedence_until_it_expires() {
    let harness = TestHarness::new();
    seed_paid(&harness, "u1", "gestao", "cus_u1").await;

    let expires_at = Utc::now() + ChronoDuration::hours(1);
    harness
        .ctx
        .overrides
        .grant("u1", "psi_regular", Some(expires_at), "support trial")
        .await
        .unwrap();

    let resolver = &harness.ctx.resolver;
    let before = resolver
        .effective_plan_at("u1", expires_at - ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(before.plan_slug, "psi_regular");
    assert_eq!(before.source, PlanSource::Override);

    let after = resolver
        .effective_plan_at("u1", expires_at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(after.plan_slug, "gestao");
    assert_eq!(after.source, PlanSource::Subscription);
}

#[tokio::test]
async fn expired_override_is_deactivated_even_if_resync_fails() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    seed_paid(&harness, "u1", "gestao", &customer_id).await;
    harness.billing.fail_customer_lookup("u1@example.com");

    let expires_at = Utc::now() + ChronoDuration::minutes(5);
    harness
        .ctx
        .overrides
        .grant("u1", "psi_regular", Some(expires_at), "migration")
        .await
        .unwrap();
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "psi_regular");

    let report = harness
        .ctx
        .override_expiry
        .run_at(expires_at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.resync_failures, 1);

    assert!(harness.store.overrides_for("u1").iter().all(|o| !o.is_active));
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "gestao");
}

#[tokio::test]
async fn immediate_cancel_drops_to_free() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 6900, created(1));
    harness.ctx.syncs.request_sync("u1", true).await.into_result().unwrap();
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "gestao");

    let report = harness.ctx.cancellation.cancel("u1", true).await.unwrap();
    assert_eq!(report.subscription_ids, vec!["sub_1"]);
    assert_eq!(report.record.plan_slug, "free");
    assert_eq!(report.record.expires_at, None);
    assert_eq!(harness.billing.cancelled_now(), vec!["sub_1"]);
    assert_eq!(harness.ctx.resolver.effective_plan("u1").await.unwrap(), "free");
}

#[tokio::test]
async fn period_end_cancel_keeps_plan_until_expiry() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 24900, Utc::now() - ChronoDuration::days(1));
    let synced = harness
        .ctx
        .syncs
        .request_sync("u1", true)
        .await
        .into_result()
        .unwrap();
    let period_end = synced.expires_at.unwrap();

    let report = harness.ctx.cancellation.cancel("u1", false).await.unwrap();
    assert_eq!(report.record.status, LocalSubscriptionStatus::PendingCancellation);
    assert_eq!(report.record.plan_slug, "psi_regular");
    assert_eq!(report.record.expires_at, Some(period_end));
    assert_eq!(harness.billing.cancelled_at_period_end(), vec!["sub_1"]);

    let resolver = &harness.ctx.resolver;
    assert_eq!(resolver.effective_plan("u1").await.unwrap(), "psi_regular");
    let lapsed = resolver
        .effective_plan_at("u1", period_end + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(lapsed.plan_slug, "free");
}

#[tokio::test]
async fn local_cancel_failure_is_partial() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 6900, created(1));
    harness.store.fail_cancels_for("u1");

    let err = harness.ctx.cancellation.cancel("u1", true).await.unwrap_err();
    assert!(matches!(err, EntitlementError::PartialFailure { .. }));
    assert_eq!(harness.billing.cancelled_now(), vec!["sub_1"]);
}

#[tokio::test]
async fn period_end_cancel_survives_later_syncs() {
    let harness = TestHarness::new();
    let customer_id = harness.customer("u1");
    harness.subscribe("sub_1", &customer_id, 6900, created(1));
    harness.ctx.syncs.request_sync("u1", true).await.into_result().unwrap();

    harness.ctx.cancellation.cancel("u1", false).await.unwrap();

    let report = harness.ctx.syncs.request_sync("u1", true).await.into_result().unwrap();
    assert_eq!(report.plan, "gestao");
    assert!(!report.changed);

    let record = harness.store.get_subscription("u1").await.unwrap().unwrap();
    assert_eq!(record.status, LocalSubscriptionStatus::PendingCancellation);
    assert_eq!(record.plan_slug, "gestao");
    assert!(record.subscribed);
}
