use std::time::Duration;

pub const DEFAULT_REPOSITORY_NAME: &str = "metrics_shm_repository";
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a provider-side repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    name: String,
    block_size: u32,
    lock_timeout: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_REPOSITORY_NAME.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl RepositoryConfig {
    /// Sets the namespace shared memory segments are created under.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Sets the default size of new blocks. Sizes are rounded up to whole
    /// 4 KiB pages and a block grows past this when one instance needs it.
    #[must_use]
    pub const fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets how long the convenience methods wait for the repository lock.
    #[must_use]
    pub const fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    #[must_use]
    pub fn repository_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn default_block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub const fn default_lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = RepositoryConfig::default();
        assert_eq!(config.repository_name(), DEFAULT_REPOSITORY_NAME);
        assert_eq!(config.default_block_size(), 65536);

        let config = config
            .name("web")
            .block_size(4096)
            .lock_timeout(Duration::from_millis(10));
        assert_eq!(config.repository_name(), "web");
        assert_eq!(config.default_block_size(), 4096);
        assert_eq!(config.default_lock_timeout(), Duration::from_millis(10));
    }
}
