//! Login policy configuration.

use std::time::Duration;

const DEFAULT_MAX_FAILED_LOGIN_ATTEMPTS: i32 = 5;
const DEFAULT_SESSION_EXPIRY_SECONDS: i64 = 15 * 60;
const DEFAULT_SESSION_REUSE_GUARD_SECONDS: i64 = 5;
const DEFAULT_STORE_TIMEOUT_SECONDS: u64 = 10;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    max_failed_login_attempts: i32,
    session_expiry_seconds: i64,
    session_reuse_guard_seconds: i64,
    store_timeout_seconds: u64,
    scope_authorization: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_failed_login_attempts: DEFAULT_MAX_FAILED_LOGIN_ATTEMPTS,
            session_expiry_seconds: DEFAULT_SESSION_EXPIRY_SECONDS,
            session_reuse_guard_seconds: DEFAULT_SESSION_REUSE_GUARD_SECONDS,
            store_timeout_seconds: DEFAULT_STORE_TIMEOUT_SECONDS,
            scope_authorization: false,
        }
    }

    #[must_use]
    pub fn with_max_failed_login_attempts(mut self, attempts: i32) -> Self {
        self.max_failed_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_session_expiry_seconds(mut self, seconds: i64) -> Self {
        self.session_expiry_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_reuse_guard_seconds(mut self, seconds: i64) -> Self {
        self.session_reuse_guard_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_store_timeout_seconds(mut self, seconds: u64) -> Self {
        self.store_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_scope_authorization(mut self, enabled: bool) -> Self {
        self.scope_authorization = enabled;
        self
    }

    #[must_use]
    pub fn max_failed_login_attempts(&self) -> i32 {
        self.max_failed_login_attempts
    }

    #[must_use]
    pub fn session_expiry_seconds(&self) -> i64 {
        self.session_expiry_seconds
    }

    #[must_use]
    pub fn session_reuse_guard_seconds(&self) -> i64 {
        self.session_reuse_guard_seconds
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_seconds)
    }

    #[must_use]
    pub fn scope_authorization(&self) -> bool {
        self.scope_authorization
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_login_policy() {
        let config = AuthConfig::default();
        assert_eq!(config.max_failed_login_attempts(), 5);
        assert_eq!(config.session_expiry_seconds(), 900);
        assert_eq!(config.session_reuse_guard_seconds(), 5);
        assert_eq!(config.store_timeout(), Duration::from_secs(10));
        assert!(!config.scope_authorization());
    }

    #[test]
    fn builders_override_defaults() {
        let config = AuthConfig::new()
            .with_max_failed_login_attempts(3)
            .with_session_expiry_seconds(60)
            .with_session_reuse_guard_seconds(1)
            .with_store_timeout_seconds(2)
            .with_scope_authorization(true);
        assert_eq!(config.max_failed_login_attempts(), 3);
        assert_eq!(config.session_expiry_seconds(), 60);
        assert_eq!(config.session_reuse_guard_seconds(), 1);
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert!(config.scope_authorization());
    }
}
