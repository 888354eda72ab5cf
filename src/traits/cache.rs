//! Cache trait for key-value storage
//!
//! Abstracts the backend holding per-user entitlement reads.

use crate::error::{EntitlementError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Cache trait for key-value storage with optional TTL
///
/// Object-safe: values cross the boundary as JSON bytes. Use [`CacheExt`] for
/// typed access.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store serialized JSON bytes. `None` uses the backend's default TTL.
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    fn is_healthy(&self) -> bool;
}

/// Typed get/set on top of [`Cache`]
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        match self.get_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                EntitlementError::internal(format!("Failed to deserialize: {}", e))
            }),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: serde::Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EntitlementError::internal(format!("Failed to serialize: {}", e)))?;
        self.set_bytes(key, bytes, ttl).await
    }
}

#[async_trait]
impl<C: Cache + ?Sized> CacheExt for C {}
