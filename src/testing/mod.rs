//! Testing utilities for code built on plansync
//!
//! - Request scenarios against the router without running a server
//! - [`TestHarness`], a context wired to the in-memory store, the mock
//!   billing client and a recording audit logger
//!
//! # Example
//!
//! ```rust,ignore
//! use plansync::testing::{self, TestHarness};
//!
//! #[tokio::test]
//! async fn free_by_default() {
//!     let harness = TestHarness::new();
//!
//!     testing::get(harness.router(), "/entitlements/me")
//!         .as_user("u1")
//!         .execute()
//!         .await
//!         .assert_ok()
//!         .assert_json_path("data.plan", serde_json::json!("free"));
//! }
//! ```

mod fixtures;
mod scenario;

pub use fixtures::{TestHarness, fake};
pub use scenario::{Scenario, ScenarioAssert, get, post};
