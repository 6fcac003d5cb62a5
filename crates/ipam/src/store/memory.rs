//! In-process bitmap store
//!
//! Holds every bitmap in one map behind one lock. Each trait method takes the
//! lock once for its whole body, which gives the same per-call atomicity a
//! server-side script has. Useful for tests and for embedding several
//! cooperating allocators in one process.

use super::{
    find_window, set_bit, validate_fill, BitmapStore, LockStore, SpaceQuery, StoreType,
};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};

/// Lock entry: owner token and deadline
#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// Bitmaps keyed by name
    bitmaps: Mutex<HashMap<String, Vec<u8>>>,
    /// Locks keyed by name
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw bitmap value
    pub fn put_raw(&self, key: &str, bitmap: Vec<u8>) {
        self.bitmaps.lock().insert(key.to_string(), bitmap);
    }

    /// Number of stored bitmaps
    pub fn len(&self) -> usize {
        self.bitmaps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.lock().is_empty()
    }
}

#[async_trait]
impl BitmapStore for InMemoryStore {
    fn store_type(&self) -> StoreType {
        StoreType::Memory
    }

    #[instrument(skip(self), level = "trace")]
    async fn fill(&self, key: &str, value: bool, start: u64, length: u64) -> Result<u64> {
        validate_fill(start, length)?;
        if length == 0 {
            return Ok(0);
        }

        let mut bitmaps = self.bitmaps.lock();
        let bitmap = bitmaps.entry(key.to_string()).or_default();
        for offset in start..start + length {
            set_bit(bitmap, offset, value);
        }

        trace!(key, value, start, length, "Filled bit range");
        Ok(length)
    }

    #[instrument(skip(self), level = "trace")]
    async fn find_space(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>> {
        query.validate()?;

        let bitmaps = self.bitmaps.lock();
        let bitmap = bitmaps.get(key).map(Vec::as_slice).unwrap_or_default();
        Ok(find_window(bitmap, query))
    }

    #[instrument(skip(self), level = "trace")]
    async fn find_and_fill(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>> {
        query.validate()?;

        let mut bitmaps = self.bitmaps.lock();
        let found = find_window(
            bitmaps.get(key).map(Vec::as_slice).unwrap_or_default(),
            query,
        );
        let Some(offset) = found else {
            return Ok(None);
        };

        let bitmap = bitmaps.entry(key.to_string()).or_default();
        for bit in offset..offset + query.length {
            set_bit(bitmap, bit, !query.value);
        }

        trace!(key, offset, length = query.length, "Claimed window");
        Ok(Some(offset))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.bitmaps.lock().get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.bitmaps.lock().remove(key).is_some();
        debug!(key, existed, "Deleted bitmap");
        Ok(existed)
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock();

        if locks.get(name).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        locks.insert(
            name.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock();

        match locks.get(name) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock();

        match locks.get_mut(name) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
