//! In-memory cache backed by moka
//!
//! Entries carry their own TTL so that a cached effective plan never outlives
//! the override it was derived from.

use crate::error::Result;
use crate::traits::cache::Cache;
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with. Reads do not extend it.
struct WrittenTtl;

impl Expiry<String, Entry> for WrittenTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Bounded in-memory cache with per-entry expiry
///
/// ```rust,ignore
/// use plansync::cache::InMemoryCache;
/// use plansync::traits::cache::CacheExt;
///
/// let cache = InMemoryCache::new(10_000);
/// cache.set("effective-plan:user-1", &"gestao", Some(Duration::from_secs(30))).await?;
/// let plan: Option<String> = cache.get("effective-plan:user-1").await?;
/// ```
#[derive(Clone)]
pub struct InMemoryCache {
    entries: MokaCache<String, Entry>,
    default_ttl: Duration,
}

impl InMemoryCache {
    /// Cache holding at most `max_entries`, with a 30 second default TTL.
    pub fn new(max_entries: u64) -> Self {
        Self::with_default_ttl(max_entries, DEFAULT_TTL)
    }

    /// `default_ttl` applies to writes that do not pass their own TTL.
    pub fn with_default_ttl(max_entries: u64, default_ttl: Duration) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(WrittenTtl)
            .build();
        Self {
            entries,
            default_ttl,
        }
    }

    /// Run pending eviction and expiry work now
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).await.map(|entry| entry.bytes))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            bytes: value,
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
