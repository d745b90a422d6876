//! Capacity constants and the runtime configuration built from them.

use std::path::PathBuf;
use std::time::Duration;

/// Well-known inbound FIFO shared by all clients.
pub const INBOUND_FIFO: &str = "/tmp/fifo_in";

/// FIFO served by the single-shot legacy protocol.
pub const LEGACY_FIFO: &str = "/tmp/server_fifo";

pub const MAX_MSG_SIZE: usize = 1024;
pub const MAX_QUEUE: usize = 100;
pub const MAX_CACHE_SIZE: usize = 100;
pub const MAX_WORKERS: usize = 4;
pub const DIGEST_BLOCK_SIZE: usize = 1024;

/// How long a response waits for its client to open the channel.
pub const RESPONSE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub inbound_path: PathBuf,
    /// Upper bound on a single framed message; also the inbound read size.
    pub max_message_len: usize,
    pub queue_capacity: usize,
    pub cache_capacity: usize,
    /// The in-flight registry shares the queue's bound.
    pub registry_capacity: usize,
    pub max_workers: usize,
    pub block_size: usize,
    pub response_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbound_path: PathBuf::from(INBOUND_FIFO),
            max_message_len: MAX_MSG_SIZE,
            queue_capacity: MAX_QUEUE,
            cache_capacity: MAX_CACHE_SIZE,
            registry_capacity: MAX_QUEUE,
            max_workers: MAX_WORKERS,
            block_size: DIGEST_BLOCK_SIZE,
            response_deadline: RESPONSE_DEADLINE,
        }
    }
}

impl Config {
    /// Applies CLI overrides on top of the compile-time defaults.
    pub fn with_overrides(
        fifo_path: Option<String>,
        max_workers: Option<usize>,
        queue_capacity: Option<usize>,
        cache_capacity: Option<usize>,
    ) -> Self {
        let mut config = Self::default();
        if let Some(path) = fifo_path {
            config.inbound_path = PathBuf::from(path);
        }
        if let Some(n) = max_workers {
            config.max_workers = n.max(1);
        }
        if let Some(n) = queue_capacity {
            config.queue_capacity = n.max(1);
            config.registry_capacity = config.queue_capacity;
        }
        if let Some(n) = cache_capacity {
            config.cache_capacity = n;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.inbound_path, PathBuf::from("/tmp/fifo_in"));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.registry_capacity, 100);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.response_deadline, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_keep_registry_tied_to_queue() {
        let config = Config::with_overrides(Some("/tmp/x".into()), Some(0), Some(8), None);
        assert_eq!(config.inbound_path, PathBuf::from("/tmp/x"));
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.registry_capacity, 8);
        assert_eq!(config.cache_capacity, MAX_CACHE_SIZE);
    }
}
