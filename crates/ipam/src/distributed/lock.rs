//! Named distributed mutexes
//!
//! A [`LockRegistry`] hands out one [`DistributedMutex`] per name and caches
//! it, so repeated lookups share the same owner token. The registry is a
//! plain value: create one per store client and pass it to whoever needs it.
//!
//! Ownership is per token, so it separates registries, not tasks. Every task
//! holding the same registry acts as one owner of a name and can release or
//! extend a hold taken by another of those tasks. Give each independent
//! owner its own registry.
//!
//! None of the allocator primitives take these locks. They exist for callers
//! composing multi-step workflows, such as `find_space` followed by a
//! conditional `fill`.

use crate::config::LockOptions;
use crate::store::LockStore;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Store key prefix for lock names
pub const LOCK_KEY_PREFIX: &str = "ipam-lock:";

/// A lock held in the shared store under a random owner token
pub struct DistributedMutex {
    /// Store key
    name: String,
    /// Owner token, unique per mutex instance
    token: String,
    /// Lock store
    store: Arc<dyn LockStore>,
    /// Expiry and retry policy
    options: RwLock<LockOptions>,
}

impl DistributedMutex {
    fn new(name: String, store: Arc<dyn LockStore>, options: LockOptions) -> Self {
        Self {
            name,
            token: Uuid::new_v4().to_string(),
            store,
            options: RwLock::new(options),
        }
    }

    /// Store key of this lock
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner token written to the store while the lock is held
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn options(&self) -> LockOptions {
        *self.options.read()
    }

    pub fn set_options(&self, options: LockOptions) {
        *self.options.write() = options;
    }

    /// Single acquisition attempt
    pub async fn try_lock(&self) -> Result<()> {
        self.try_lock_for(self.options().expiry).await
    }

    /// Single acquisition attempt held for `expiry`, ignoring the stored options
    pub async fn try_lock_for(&self, expiry: Duration) -> Result<()> {
        if self.store.acquire(&self.name, &self.token, expiry).await? {
            trace!(lock = %self.name, "Lock acquired");
            Ok(())
        } else {
            Err(Error::LockNotAcquired(self.name.clone()))
        }
    }

    /// Acquire, retrying up to `tries` times with `retry_delay` in between
    pub async fn lock(&self) -> Result<()> {
        self.lock_with(self.options()).await
    }

    /// Acquire under `options` instead of the stored ones
    pub async fn lock_with(&self, options: LockOptions) -> Result<()> {
        let tries = options.tries.max(1);

        for attempt in 1..=tries {
            if self.store.acquire(&self.name, &self.token, options.expiry).await? {
                debug!(lock = %self.name, attempt, "Lock acquired");
                return Ok(());
            }
            if attempt < tries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        warn!(lock = %self.name, tries, "Lock not acquired");
        Err(Error::LockNotAcquired(self.name.clone()))
    }

    /// Release the lock if this mutex still owns it
    pub async fn unlock(&self) -> Result<bool> {
        let released = self.store.release(&self.name, &self.token).await?;
        trace!(lock = %self.name, released, "Lock released");
        Ok(released)
    }

    /// Reset the expiry if this mutex still owns the lock
    pub async fn extend(&self) -> Result<bool> {
        self.extend_for(self.options().expiry).await
    }

    /// Reset the expiry to `expiry` if this mutex still owns the lock
    pub async fn extend_for(&self, expiry: Duration) -> Result<bool> {
        self.store.extend(&self.name, &self.token, expiry).await
    }
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("name", &self.name)
            .field("options", &self.options())
            .finish_non_exhaustive()
    }
}

/// Registry of named distributed mutexes
///
/// All callers sharing one registry share one token per name: a hold taken
/// through it can be released or extended by any of them. Mutual exclusion
/// holds between registries.
pub struct LockRegistry {
    store: Arc<dyn LockStore>,
    defaults: LockOptions,
    lockers: DashMap<String, Arc<DistributedMutex>>,
}

impl LockRegistry {
    /// Create a registry with default lock options
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_defaults(store, LockOptions::default())
    }

    /// Create a registry with custom default lock options
    pub fn with_defaults(store: Arc<dyn LockStore>, defaults: LockOptions) -> Self {
        Self {
            store,
            defaults,
            lockers: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> LockOptions {
        self.defaults
    }

    /// Get or create the mutex for `key`
    ///
    /// Blank keys are rejected. The returned mutex keeps whatever options it
    /// was last given.
    pub fn locker(&self, key: &str) -> Result<Arc<DistributedMutex>> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidArgument("lock key must not be empty".into()));
        }

        let name = format!("{}{}", LOCK_KEY_PREFIX, key);
        let locker = self
            .lockers
            .entry(name.clone())
            .or_insert_with(|| Arc::new(DistributedMutex::new(name, self.store.clone(), self.defaults)))
            .clone();
        Ok(locker)
    }

    /// Get or create the mutex for `key` and apply `options` to it
    pub fn locker_with(&self, key: &str, options: LockOptions) -> Result<Arc<DistributedMutex>> {
        let locker = self.locker(key)?;
        locker.set_options(options);
        Ok(locker)
    }

    /// One attempt to take `key` for `expiry`
    pub async fn try_lock(&self, key: &str, expiry: Duration) -> Result<()> {
        self.locker(key)?.try_lock_for(expiry).await
    }

    /// Take `key` for `expiry`, retrying up to `tries` times
    pub async fn lock(&self, key: &str, expiry: Duration, tries: u32) -> Result<()> {
        let locker = self.locker(key)?;
        let options = locker.options().with_expiry(expiry).with_tries(tries);
        locker.lock_with(options).await
    }

    /// Release `key` if this registry holds it
    pub async fn unlock(&self, key: &str) -> Result<bool> {
        self.locker(key)?.unlock().await
    }

    /// Extend `key` by `expiry` if this registry holds it
    pub async fn extend(&self, key: &str, expiry: Duration) -> Result<bool> {
        self.locker(key)?.extend_for(expiry).await
    }

    /// Number of cached mutexes
    pub fn len(&self) -> usize {
        self.lockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lockers.is_empty()
    }
}
