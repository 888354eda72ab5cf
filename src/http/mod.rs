//! HTTP surface.
//!
//! Per-user routes read the user from [`AuthenticatedUser`] in request
//! extensions, which the host's authentication layer is expected to insert.
//! Job routes take no arguments and should be reachable only by operators.

pub mod extractors;
pub mod handlers;
pub mod response;
pub mod routes;

use axum::Router;

use crate::app::AppContext;

pub use extractors::{AuthenticatedUser, CurrentUser};
pub use handlers::{CancelRequest, CheckoutLinkResponse, JobRoutes, SubscriptionRoutes, SyncRequest};
pub use response::{ApiResponse, JsonResponse};
pub use routes::RouteModule;

/// Router with every route registered and state applied.
pub fn router(ctx: AppContext) -> Router {
    let router = SubscriptionRoutes.register(Router::new());
    JobRoutes.register(router).with_state(ctx)
}
