/// Get environment variable with PLANSYNC_ prefix, falling back to unprefixed version
///
/// Checks `PLANSYNC_{key}` first, then `{key}`.
///
/// ```rust,ignore
/// use plansync::utils::get_env_with_prefix;
///
/// // Checks PLANSYNC_SYNC_DEBOUNCE_MS first, then SYNC_DEBOUNCE_MS
/// let debounce = get_env_with_prefix("SYNC_DEBOUNCE_MS");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("PLANSYNC_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("PLANSYNC_ENV_TEST_VAR", "prefixed_value");
            std::env::set_var("ENV_TEST_VAR", "unprefixed_value");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("PLANSYNC_ENV_TEST_VAR");
        }
        assert_eq!(get_env_with_prefix("ENV_TEST_VAR"), Some("unprefixed_value".to_string()));
        unsafe {
            std::env::remove_var("ENV_TEST_VAR");
        }

        assert_eq!(get_env_with_prefix("ENV_TEST_MISSING_VAR"), None);
    }
}
