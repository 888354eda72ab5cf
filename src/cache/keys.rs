use crate::traits::cache::Cache;

/// Cache key layout for per-user entitlement reads.
pub struct CacheKeys;

impl CacheKeys {
    pub const EFFECTIVE_PLAN: &'static str = "effective-plan";
    pub const USAGE_LIMIT: &'static str = "usage-limit";
    pub const PLAN_FEATURES: &'static str = "plan-features";

    pub fn effective_plan(user_id: &str) -> String {
        format!("{}:{}", Self::EFFECTIVE_PLAN, user_id)
    }

    pub fn usage_limit(user_id: &str) -> String {
        format!("{}:{}", Self::USAGE_LIMIT, user_id)
    }

    pub fn plan_features(user_id: &str) -> String {
        format!("{}:{}", Self::PLAN_FEATURES, user_id)
    }

    /// Every key derived from a user's entitlement.
    pub fn for_user(user_id: &str) -> [String; 3] {
        [
            Self::effective_plan(user_id),
            Self::usage_limit(user_id),
            Self::plan_features(user_id),
        ]
    }

    /// Drop every entitlement-derived entry for the user.
    ///
    /// Failures are logged and skipped; a stale entry still expires on its TTL.
    pub async fn invalidate_user(cache: &dyn Cache, user_id: &str) {
        for key in Self::for_user(user_id) {
            if let Err(e) = cache.delete(&key).await {
                tracing::warn!(user_id = %user_id, key = %key, error = %e, "Failed to invalidate cache entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::traits::cache::CacheExt;

    #[test]
    fn test_key_format() {
        assert_eq!(CacheKeys::effective_plan("u1"), "effective-plan:u1");
        assert_eq!(CacheKeys::usage_limit("u1"), "usage-limit:u1");
        assert_eq!(CacheKeys::plan_features("u1"), "plan-features:u1");
    }

    #[tokio::test]
    async fn test_invalidate_user_removes_all_three_keys() {
        let cache = InMemoryCache::new(100);
        for key in CacheKeys::for_user("u1") {
            cache.set(&key, &"cached", None).await.unwrap();
        }
        cache.set("effective-plan:u2", &"other", None).await.unwrap();

        CacheKeys::invalidate_user(&cache, "u1").await;

        for key in CacheKeys::for_user("u1") {
            assert_eq!(cache.get::<String>(&key).await.unwrap(), None);
        }
        assert_eq!(
            cache.get::<String>("effective-plan:u2").await.unwrap(),
            Some("other".to_string())
        );
    }
}
