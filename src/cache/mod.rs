//! Read caches for per-user entitlement data.
//!
//! The resolver stores effective plan, usage limit and feature flags here.
//! A successful sync invalidates all three keys for the user.

mod config;
mod in_memory;
mod keys;
mod noop;

pub use config::{CacheBackend, CacheConfig};
pub use in_memory::InMemoryCache;
pub use keys::CacheKeys;
pub use noop::NoOpCache;
