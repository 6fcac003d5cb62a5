//! Configuration for allocators, stores and distributed locks
//!
//! Every config has a `Default`. The allocator and store configs also read
//! `IPAM_*` environment variables in `from_env()`; unset or unparsable values
//! fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on host bits for an in-memory bitset (counts are `u32`)
pub const MAX_LOCAL_HOST_BITS: u8 = 31;

/// Configuration for [`LocalBitsetAllocator`](crate::allocator::LocalBitsetAllocator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAllocatorConfig {
    /// Largest block (in host bits) the allocator accepts. Clamped to
    /// [`MAX_LOCAL_HOST_BITS`].
    pub max_host_bits: u8,
}

impl Default for LocalAllocatorConfig {
    fn default() -> Self {
        Self { max_host_bits: 24 }
    }
}

impl LocalAllocatorConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_host_bits: std::env::var("IPAM_MAX_HOST_BITS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_host_bits),
        }
    }

    /// Effective limit after clamping to the hard ceiling
    pub fn effective_max_host_bits(&self) -> u8 {
        self.max_host_bits.min(MAX_LOCAL_HOST_BITS)
    }
}

/// Connection settings for the Redis-backed store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`
    pub url: String,
    /// Prefix prepended to every bitmap and lock key
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: String::new(),
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("IPAM_REDIS_URL").unwrap_or(defaults.url),
            key_prefix: std::env::var("IPAM_REDIS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        }
    }

    /// Full store key for an application key
    pub fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// Expiry and retry policy for a distributed mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// How long the lock is held before the store expires it
    pub expiry: Duration,
    /// Maximum acquisition attempts made by `lock()`
    pub tries: u32,
    /// Pause between acquisition attempts
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(8),
            tries: 32,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl LockOptions {
    /// Override the expiry
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Override the number of attempts (at least one is always made)
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    /// Override the pause between attempts
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_default() {
        let config = LocalAllocatorConfig::default();
        assert_eq!(config.max_host_bits, 24);
        assert_eq!(config.effective_max_host_bits(), 24);
    }

    #[test]
    fn test_local_config_clamped() {
        let config = LocalAllocatorConfig { max_host_bits: 64 };
        assert_eq!(config.effective_max_host_bits(), MAX_LOCAL_HOST_BITS);
    }

    // Only test that touches IPAM_MAX_HOST_BITS, so the steps run in order
    #[test]
    fn test_local_config_from_env() {
        std::env::set_var("IPAM_MAX_HOST_BITS", "16");
        assert_eq!(LocalAllocatorConfig::from_env().max_host_bits, 16);

        std::env::set_var("IPAM_MAX_HOST_BITS", "40");
        let config = LocalAllocatorConfig::from_env();
        assert_eq!(config.max_host_bits, 40);
        assert_eq!(config.effective_max_host_bits(), MAX_LOCAL_HOST_BITS);

        for bad in ["", "twenty", "-1", "300"] {
            std::env::set_var("IPAM_MAX_HOST_BITS", bad);
            assert_eq!(LocalAllocatorConfig::from_env(), LocalAllocatorConfig::default());
        }

        std::env::remove_var("IPAM_MAX_HOST_BITS");
        assert_eq!(LocalAllocatorConfig::from_env(), LocalAllocatorConfig::default());
    }

    #[test]
    fn test_redis_config_prefix() {
        let config = RedisStoreConfig {
            key_prefix: "tenant-a:".to_string(),
            ..Default::default()
        };
        assert_eq!(config.prefixed("pool"), "tenant-a:pool");
        assert_eq!(RedisStoreConfig::default().prefixed("pool"), "pool");
    }

    #[test]
    fn test_lock_options_builders() {
        let options = LockOptions::default()
            .with_expiry(Duration::from_secs(2))
            .with_tries(0)
            .with_retry_delay(Duration::from_millis(5));

        assert_eq!(options.expiry, Duration::from_secs(2));
        assert_eq!(options.tries, 1);
        assert_eq!(options.retry_delay, Duration::from_millis(5));
    }
}
