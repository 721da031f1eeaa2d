//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync authority.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Application id clients must present.
    pub app_id: String,
    /// Directory of the canonical store. `None` keeps it in memory.
    pub store_path: Option<PathBuf>,
    /// Maximum batch size for pull responses.
    pub max_pull_batch: u32,
    /// Maximum batch size for push requests.
    pub max_push_batch: u32,
    /// How many change-log entries are retained for pulls.
    pub max_log_entries: usize,
    /// Secret key for token signing.
    pub auth_secret: Vec<u8>,
    /// How long issued tokens stay valid.
    pub token_expiry: Duration,
    /// Sessions idle for longer than this are forgotten.
    pub session_idle_timeout: Duration,
    /// Open sessions kept per principal. The least recently used one is
    /// evicted when a new session would exceed it.
    pub max_sessions_per_principal: usize,
}

impl ServerConfig {
    /// Creates a configuration for `app_id` with an in-memory store and a
    /// random signing secret.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            store_path: None,
            max_pull_batch: 100,
            max_push_batch: 100,
            max_log_entries: 10_000,
            auth_secret: rand::random::<[u8; 32]>().to_vec(),
            token_expiry: Duration::from_secs(24 * 60 * 60),
            session_idle_timeout: Duration::from_secs(30 * 60),
            max_sessions_per_principal: 16,
        }
    }

    /// Persists the canonical store under `path`.
    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Sets the maximum pull batch size.
    #[must_use]
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    #[must_use]
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets how many change-log entries are retained.
    #[must_use]
    pub fn with_max_log_entries(mut self, entries: usize) -> Self {
        self.max_log_entries = entries;
        self
    }

    /// Uses a fixed signing secret, so tokens survive restarts.
    #[must_use]
    pub fn with_auth_secret(mut self, secret: Vec<u8>) -> Self {
        self.auth_secret = secret;
        self
    }

    /// Sets the token lifetime.
    #[must_use]
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Sets how long an idle session is kept.
    #[must_use]
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    /// Sets how many sessions one principal may hold.
    #[must_use]
    pub fn with_max_sessions_per_principal(mut self, max: usize) -> Self {
        self.max_sessions_per_principal = max.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("treesync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_pull_batch, 100);
        assert!(config.store_path.is_none());
        assert_eq!(config.auth_secret.len(), 32);
        assert_eq!(config.max_sessions_per_principal, 16);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("app")
            .with_max_pull_batch(50)
            .with_max_log_entries(8)
            .with_auth_secret(vec![1, 2, 3, 4])
            .with_store_path("/tmp/authority")
            .with_max_sessions_per_principal(0);

        assert_eq!(config.app_id, "app");
        assert_eq!(config.max_pull_batch, 50);
        assert_eq!(config.max_log_entries, 8);
        assert_eq!(config.auth_secret, vec![1, 2, 3, 4]);
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/authority")));
        assert_eq!(config.max_sessions_per_principal, 1);
    }
}
