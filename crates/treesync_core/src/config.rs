//! Local store configuration.

/// Configuration for opening a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether every commit calls `sync` on the log (otherwise `flush`).
    pub sync_on_commit: bool,

    /// Write a snapshot and truncate the log after this many commits
    /// (0 = never).
    pub checkpoint_every: u64,

    /// Whether `close` writes a final snapshot.
    pub checkpoint_on_close: bool,

    /// How many change records the change feed keeps for polling.
    pub feed_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            checkpoint_every: 1024,
            checkpoint_on_close: true,
            feed_history: 4096,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic checkpoint interval in commits.
    #[must_use]
    pub const fn checkpoint_every(mut self, commits: u64) -> Self {
        self.checkpoint_every = commits;
        self
    }

    /// Sets whether closing the store writes a snapshot.
    #[must_use]
    pub const fn checkpoint_on_close(mut self, value: bool) -> Self {
        self.checkpoint_on_close = value;
        self
    }

    /// Sets the change feed history length.
    #[must_use]
    pub const fn feed_history(mut self, records: usize) -> Self {
        self.feed_history = records;
        self
    }
}
