//! Per-user and automation endpoints.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::extractors::CurrentUser;
use super::response::{ApiResponse, JsonResponse};
use super::routes::RouteModule;
use crate::app::AppContext;
use crate::entitlements::EntitlementSummary;
use crate::error::{EntitlementError, Result};
use crate::jobs::run_job;
use crate::sync::{
    CancellationReport, CheckoutLink, DuplicateResolution, SyncOutcome, SyncReport, SyncStatus,
};
use crate::traits::job::ScheduledJob;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelRequest {
    /// Cancel now instead of at period end
    pub immediate: bool,
}

#[derive(Debug, Serialize)]
pub struct CheckoutLinkResponse {
    pub link: CheckoutLink,
    /// Forced resync after linking. Failure here does not undo the link.
    pub sync: SyncOutcome,
}

/// Routes acting on the authenticated user
pub struct SubscriptionRoutes;

impl RouteModule for SubscriptionRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/entitlements/me", get(my_entitlements))
            .route("/subscription/sync", post(request_sync))
            .route("/subscription/sync/status", get(sync_status))
            .route("/subscription/cancel", post(cancel_subscription))
            .route("/subscription/duplicates/resolve", post(resolve_duplicates))
            .route("/checkout/{session_id}/link", post(link_checkout))
    }
}

/// Argument-less job triggers for schedulers and operators
pub struct JobRoutes;

impl RouteModule for JobRoutes {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/reconciliation-sweep", post(run_sweep))
            .route("/override-expiry", post(run_override_expiry))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/jobs")
    }
}

/// Empty bodies are accepted and mean "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| EntitlementError::bad_request(format!("invalid request body: {}", e)))
}

async fn my_entitlements(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
) -> JsonResponse<EntitlementSummary> {
    Ok(ApiResponse::success(ctx.resolver.entitlements(&user_id).await?))
}

async fn request_sync(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> JsonResponse<SyncReport> {
    let request: SyncRequest = parse_body(&body)?;
    let report = ctx
        .syncs
        .request_sync(&user_id, request.force)
        .await
        .into_result()?;
    Ok(ApiResponse::success(report))
}

async fn sync_status(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
) -> JsonResponse<SyncStatus> {
    Ok(ApiResponse::success(ctx.syncs.coordinator(&user_id).status().await?))
}

async fn cancel_subscription(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> JsonResponse<CancellationReport> {
    let request: CancelRequest = parse_body(&body)?;
    let report = ctx.cancellation.cancel(&user_id, request.immediate).await?;
    Ok(ApiResponse::success(report))
}

async fn resolve_duplicates(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
) -> JsonResponse<DuplicateResolution> {
    Ok(ApiResponse::success(ctx.duplicates.resolve(&user_id).await?))
}

async fn link_checkout(
    State(ctx): State<AppContext>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
) -> JsonResponse<CheckoutLinkResponse> {
    let link = ctx.checkout.link(&session_id, &user_id).await?;
    let sync = ctx.syncs.request_sync(&user_id, true).await;
    let resynced = sync.success;
    if !resynced {
        tracing::warn!(
            target: "plansync::http",
            user_id = %user_id,
            session_id = %session_id,
            error = sync.error.as_deref().unwrap_or(""),
            "Resync after checkout link failed"
        );
    }

    let response = ApiResponse::success(CheckoutLinkResponse { link, sync });
    if resynced {
        Ok(response)
    } else {
        Ok(response.with_message("checkout linked; plan will update on the next sync"))
    }
}

async fn run_sweep(State(ctx): State<AppContext>) -> JsonResponse<serde_json::Value> {
    run_on_demand(ctx.sweep.as_ref()).await
}

async fn run_override_expiry(State(ctx): State<AppContext>) -> JsonResponse<serde_json::Value> {
    run_on_demand(ctx.override_expiry.as_ref()).await
}

async fn run_on_demand(job: &dyn ScheduledJob) -> JsonResponse<serde_json::Value> {
    Ok(ApiResponse::success(run_job(job).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_defaults() {
        let empty: SyncRequest = parse_body(&Bytes::new()).unwrap();
        assert!(!empty.force);

        let forced: SyncRequest = parse_body(&Bytes::from_static(br#"{"force": true}"#)).unwrap();
        assert!(forced.force);

        let partial: CancelRequest = parse_body(&Bytes::from_static(b"{}")).unwrap();
        assert!(!partial.immediate);

        let bad = parse_body::<CancelRequest>(&Bytes::from_static(b"{nope"));
        assert!(matches!(bad, Err(EntitlementError::BadRequest(_))));
    }

    struct BrokenJob;

    #[async_trait::async_trait]
    impl ScheduledJob for BrokenJob {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run(&self) -> Result<serde_json::Value> {
            Err(EntitlementError::configuration("free plan not found"))
        }
    }

    #[tokio::test]
    async fn test_run_on_demand_propagates_job_error() {
        let err = run_on_demand(&BrokenJob).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Configuration(_)));
    }
}
