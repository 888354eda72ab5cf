use crate::error::EntitlementError;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::future::Future;

/// Identity placed in request extensions by the host's authentication layer.
///
/// Session handling is not done here; this crate only consumes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Axum extractor for the authenticated user id
///
/// Rejects with 401 when no [`AuthenticatedUser`] is present.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(CurrentUser(user_id): CurrentUser) -> String {
///     user_id
/// }
/// ```
pub struct CurrentUser(pub String);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = EntitlementError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let user = parts.extensions.get::<AuthenticatedUser>().cloned();
        async move {
            match user {
                Some(user) if !user.user_id.is_empty() => Ok(CurrentUser(user.user_id)),
                _ => Err(EntitlementError::unauthenticated("no authenticated user")),
            }
        }
    }
}
