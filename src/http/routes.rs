use axum::Router;

use crate::app::AppContext;

/// A group of routes mounted on the plansync router
///
/// Routers are returned without state; [`router`](super::router) applies the
/// [`AppContext`] once after every group is registered.
pub trait RouteModule: Sized {
    fn routes(&self) -> Router<AppContext>;

    /// Mount point for the group. `None` merges at the root.
    fn prefix(&self) -> Option<&str> {
        None
    }

    fn register(self, router: Router<AppContext>) -> Router<AppContext> {
        let routes = self.routes();
        match self.prefix() {
            Some(prefix) => router.nest(prefix, routes),
            None => router.merge(routes),
        }
    }
}
