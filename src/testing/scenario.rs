//! Request scenarios against a [`Router`] without starting a server.
//!
//! # Example
//!
//! ```rust,ignore
//! use plansync::testing;
//!
//! #[tokio::test]
//! async fn me_requires_user() {
//!     let harness = testing::TestHarness::new();
//!
//!     testing::get(harness.router(), "/entitlements/me")
//!         .execute()
//!         .await
//!         .assert_unauthorized();
//! }
//! ```

use axum::{
    Router,
    body::{Body, Bytes},
    http::{Method, Request, StatusCode, header},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tower::ServiceExt;

use crate::http::AuthenticatedUser;

/// Builder for a single request against an app
pub struct Scenario {
    app: Router,
    request: Request<Body>,
}

impl Scenario {
    pub fn new(app: Router) -> Self {
        Self {
            app,
            request: Request::builder()
                .method(Method::GET)
                .uri("/")
                .body(Body::empty())
                .unwrap(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        *self.request.method_mut() = method;
        self
    }

    pub fn uri(mut self, uri: &str) -> Self {
        *self.request.uri_mut() = uri.parse().unwrap();
        self
    }

    /// Act as `user_id`, the way an authentication layer in front of the
    /// router would.
    pub fn as_user(mut self, user_id: &str) -> Self {
        self.request
            .extensions_mut()
            .insert(AuthenticatedUser::new(user_id));
        self
    }

    /// Set JSON body from a serializable type
    pub fn json_body<T: Serialize>(mut self, body: &T) -> Self {
        let json = serde_json::to_string(body).unwrap();
        *self.request.body_mut() = Body::from(json);
        self.request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        self
    }

    /// Set a raw body, e.g. malformed JSON
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        *self.request.body_mut() = Body::from(body.into());
        self
    }

    /// Send the request and buffer the whole response.
    pub async fn execute(self) -> ScenarioAssert {
        let response = self.app.oneshot(self.request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        ScenarioAssert {
            status,
            content_type,
            body,
        }
    }
}

/// Buffered response with chainable assertions
pub struct ScenarioAssert {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

impl ScenarioAssert {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.status,
            expected,
            "Expected status {}, got {}. Body: {}",
            expected,
            self.status,
            String::from_utf8_lossy(&self.body)
        );
        self
    }

    pub fn assert_ok(self) -> Self {
        self.assert_status(StatusCode::OK)
    }

    pub fn assert_bad_request(self) -> Self {
        self.assert_status(StatusCode::BAD_REQUEST)
    }

    pub fn assert_unauthorized(self) -> Self {
        self.assert_status(StatusCode::UNAUTHORIZED)
    }

    pub fn assert_not_found(self) -> Self {
        self.assert_status(StatusCode::NOT_FOUND)
    }

    /// 409, returned while a sync for the user is running
    pub fn assert_conflict(self) -> Self {
        self.assert_status(StatusCode::CONFLICT)
    }

    pub fn assert_unprocessable(self) -> Self {
        self.assert_status(StatusCode::UNPROCESSABLE_ENTITY)
    }

    pub fn assert_json(self) -> Self {
        let content_type = self.content_type.as_deref().unwrap_or("");
        assert!(
            content_type.contains("application/json"),
            "Expected JSON content type, got: {:?}",
            self.content_type
        );
        self
    }

    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body).expect("Failed to parse JSON response")
    }

    /// Assert a dotted path (`data.plan`, `data.cancelled.0`) equals `expected`
    pub fn assert_json_path(self, path: &str, expected: serde_json::Value) -> Self {
        let json: serde_json::Value = self.json();
        let actual =
            json_path_get(&json, path).unwrap_or_else(|| panic!("Path '{}' not found in {}", path, json));
        assert_eq!(actual, &expected, "JSON path '{}' value mismatch", path);
        self
    }

    /// Assert a dotted path is absent
    pub fn assert_no_json_path(self, path: &str) -> Self {
        let json: serde_json::Value = self.json();
        assert!(json_path_get(&json, path).is_none(), "Path '{}' present in {}", path, json);
        self
    }
}

fn json_path_get<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        current = match part.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(part)?,
        };
    }
    Some(current)
}

pub fn get(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::GET).uri(uri)
}

pub fn post(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::POST).uri(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::CurrentUser;
    use axum::{Json, routing::get as axum_get};
    use serde_json::json;

    async fn whoami(CurrentUser(user_id): CurrentUser) -> Json<serde_json::Value> {
        Json(json!({"data": {"user": user_id, "tags": ["a", "b"]}}))
    }

    #[tokio::test]
    async fn test_as_user_sets_identity() {
        let app = Router::new().route("/whoami", axum_get(whoami));

        get(app.clone(), "/whoami")
            .execute()
            .await
            .assert_unauthorized();

        get(app, "/whoami")
            .as_user("u1")
            .execute()
            .await
            .assert_ok()
            .assert_json()
            .assert_json_path("data.user", json!("u1"))
            .assert_json_path("data.tags.1", json!("b"))
            .assert_no_json_path("data.missing");
    }

    #[test]
    fn test_json_path_get() {
        let value = json!({"a": {"b": [1, {"c": true}]}});
        assert_eq!(json_path_get(&value, "a.b.1.c"), Some(&json!(true)));
        assert_eq!(json_path_get(&value, "a.missing"), None);
    }
}
