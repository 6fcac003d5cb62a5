//! Shared bitmap stores
//!
//! A store holds allocation bitmaps under string keys and runs each
//! primitive as one indivisible server-side operation:
//!
//! 1. **Memory** - a single process-local map behind one lock (tests, embedding)
//! 2. **Redis** - Lua scripts via `EVALSHA`, one script per primitive
//!    (feature `redis`)
//!
//! # Atomicity boundary
//!
//! Each call to [`BitmapStore::fill`], [`BitmapStore::find_space`] or
//! [`BitmapStore::find_and_fill`] is atomic. A *sequence* of calls is not:
//! between `find_space` and a following `fill`, another client can claim the
//! same window. Use [`BitmapStore::find_and_fill`] when the claim must be
//! exclusive, or take a lock from
//! [`LockRegistry`](crate::distributed::LockRegistry) around the workflow.
//!
//! # Wire layout
//!
//! A bitmap is a binary string. Bit `n` is bit `7 - n % 8` of byte `n / 8`
//! (most significant bit first, as Redis `SETBIT`/`GETBIT` number them).
//! Bits past the end of the stored value read as `0`.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire value a scan returns when no window qualifies
pub const NOT_FOUND: i64 = -1;

/// Highest addressable bit offset (Redis bitmaps are capped at 512 MiB)
pub const MAX_BIT_OFFSET: u64 = (1 << 32) - 1;

/// Type of bitmap store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreType {
    /// In-process map, atomic under a single lock
    Memory,
    /// Redis server, atomic through Lua scripts
    Redis,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Redis => write!(f, "redis"),
        }
    }
}

/// Parameters of a window scan
///
/// Candidate offsets are `start, start + step, ...`; a window of `length`
/// bits qualifies when every bit equals `value` and the window ends at or
/// before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceQuery {
    /// Window width in bits
    pub length: u64,
    /// Bit value every position of the window must hold
    pub value: bool,
    /// First candidate offset
    pub start: u64,
    /// Exclusive upper bound of the scanned range
    pub end: u64,
    /// Distance between candidate offsets
    pub step: u64,
}

impl SpaceQuery {
    /// Scan `[start, end)` one offset at a time
    pub fn new(length: u64, value: bool, start: u64, end: u64) -> Self {
        Self {
            length,
            value,
            start,
            end,
            step: 1,
        }
    }

    /// Override the distance between candidate offsets
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Reject malformed scans the way the store script would
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(Error::Script("window length must be positive".into()));
        }
        if self.step == 0 {
            return Err(Error::Script("scan step must be positive".into()));
        }
        if self.start > self.end {
            return Err(Error::Script(format!(
                "scan start {} is past end {}",
                self.start, self.end
            )));
        }
        if self.end > MAX_BIT_OFFSET + 1 {
            return Err(Error::Script(format!(
                "scan end {} exceeds bitmap capacity",
                self.end
            )));
        }
        Ok(())
    }

    /// First candidate offset at or after `pos` whose window fits before `end`
    pub fn next_candidate(&self, pos: u64) -> Option<u64> {
        let step = self.step.max(1);
        let offset = if pos <= self.start {
            self.start
        } else {
            let steps = (pos - self.start).div_ceil(step);
            self.start.checked_add(steps.checked_mul(step)?)?
        };
        let window_end = offset.checked_add(self.length)?;
        (window_end <= self.end).then_some(offset)
    }
}

/// Decode the integer a scan script replies with
///
/// `-1` means no window qualified; any other negative value is a script fault.
pub fn decode_offset(reply: i64) -> Result<Option<u64>> {
    if reply == NOT_FOUND {
        return Ok(None);
    }
    u64::try_from(reply)
        .map(Some)
        .map_err(|_| Error::Script(format!("scan replied with invalid offset {}", reply)))
}

/// Reject a fill range that does not fit the bitmap
pub fn validate_fill(start: u64, length: u64) -> Result<()> {
    if length == 0 {
        return Ok(());
    }
    match start.checked_add(length - 1) {
        Some(last) if last <= MAX_BIT_OFFSET => Ok(()),
        _ => Err(Error::Script(format!(
            "fill of {} bits at offset {} exceeds bitmap capacity",
            length, start
        ))),
    }
}

/// Read bit `offset` from a raw bitmap value
pub fn get_bit(bitmap: &[u8], offset: u64) -> bool {
    let byte = (offset / 8) as usize;
    let mask = 0x80u8 >> (offset % 8);
    bitmap.get(byte).is_some_and(|b| b & mask != 0)
}

/// Write bit `offset` of a raw bitmap value, growing it with zero bytes
pub fn set_bit(bitmap: &mut Vec<u8>, offset: u64, value: bool) {
    let byte = (offset / 8) as usize;
    let mask = 0x80u8 >> (offset % 8);
    if byte >= bitmap.len() {
        if !value {
            return;
        }
        bitmap.resize(byte + 1, 0);
    }
    if value {
        bitmap[byte] |= mask;
    } else {
        bitmap[byte] &= !mask;
    }
}

/// First bit in `[from, to)` equal to `value`, skipping whole bytes
pub fn find_bit(bitmap: &[u8], value: bool, from: u64, to: u64) -> Option<u64> {
    let mut pos = from;
    while pos < to {
        let index = pos / 8;
        let byte = match bitmap.get(index as usize) {
            Some(&byte) => byte,
            // Past the end every bit reads as 0
            None if value => return None,
            None => 0,
        };

        let wanted = if value { byte } else { !byte };
        let masked = wanted & (0xffu8 >> (pos % 8));
        if masked != 0 {
            let hit = index * 8 + u64::from(masked.leading_zeros());
            return (hit < to).then_some(hit);
        }
        pos = (index + 1) * 8;
    }
    None
}

/// First offset whose window matches `query`, against a raw bitmap value
///
/// Jumps past the first mismatching bit of a rejected window, then to the
/// next bit that could start one, so runs of the wrong value cost one pass.
pub fn find_window(bitmap: &[u8], query: &SpaceQuery) -> Option<u64> {
    let mut offset = query.next_candidate(query.start)?;
    loop {
        let window_end = offset + query.length;
        let Some(miss) = find_bit(bitmap, !query.value, offset, window_end) else {
            return Some(offset);
        };
        let resume = find_bit(bitmap, query.value, miss + 1, query.end)?;
        offset = query.next_candidate(resume)?;
    }
}

/// Number of set bits among the first `bit_len` bits of a raw bitmap value
pub fn count_ones(bitmap: &[u8], bit_len: u64) -> u64 {
    let full_bytes = (bit_len / 8) as usize;
    let mut count: u64 = bitmap
        .iter()
        .take(full_bytes)
        .map(|b| u64::from(b.count_ones()))
        .sum();

    let tail_bits = (bit_len % 8) as u32;
    if tail_bits > 0 {
        if let Some(b) = bitmap.get(full_bytes) {
            let mask = !(0xffu8 >> tail_bits);
            count += u64::from((b & mask).count_ones());
        }
    }
    count
}

/// Bitmap store trait
///
/// All implementations must run each method as one atomic operation against
/// the shared state. See the module docs for what is *not* guaranteed.
#[async_trait]
pub trait BitmapStore: Send + Sync {
    /// Get the store type
    fn store_type(&self) -> StoreType;

    /// Set `length` bits starting at `start` to `value`
    ///
    /// All-or-nothing; returns the number of bits written.
    async fn fill(&self, key: &str, value: bool, start: u64, length: u64) -> Result<u64>;

    /// First offset whose window matches `query`, or `None`
    ///
    /// Read-only. The result may be stale by the time the caller acts on it.
    async fn find_space(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>>;

    /// Find a window like [`find_space`](Self::find_space) and flip every bit
    /// of it to `!query.value`, in one atomic operation
    async fn find_and_fill(&self, key: &str, query: &SpaceQuery) -> Result<Option<u64>>;

    /// Raw bitmap value (empty if the key does not exist)
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a bitmap. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Store-side primitives for expiring, token-owned locks
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `name` to `token` if it is unset. Returns whether the lock was taken.
    async fn acquire(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `name` if it still holds `token`
    async fn release(&self, name: &str, token: &str) -> Result<bool>;

    /// Reset the expiry of `name` if it still holds `token`
    async fn extend(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_store_type_display() {
        assert_eq!(StoreType::Memory.to_string(), "memory");
        assert_eq!(StoreType::Redis.to_string(), "redis");
    }

    #[test]
    fn test_bit_layout_is_msb_first() {
        let mut bitmap = Vec::new();
        set_bit(&mut bitmap, 0, true);
        assert_eq!(bitmap, vec![0b1000_0000]);

        set_bit(&mut bitmap, 7, true);
        set_bit(&mut bitmap, 9, true);
        assert_eq!(bitmap, vec![0b1000_0001, 0b0100_0000]);

        assert!(get_bit(&bitmap, 9));
        assert!(!get_bit(&bitmap, 8));
        assert!(!get_bit(&bitmap, 1000));
    }

    #[test]
    fn test_clearing_past_end_does_not_grow() {
        let mut bitmap = vec![0xff];
        set_bit(&mut bitmap, 100, false);
        assert_eq!(bitmap.len(), 1);
    }

    #[test]
    fn test_count_ones_respects_bit_len() {
        let bitmap = vec![0xff, 0xff];
        assert_eq!(count_ones(&bitmap, 16), 16);
        assert_eq!(count_ones(&bitmap, 11), 11);
        assert_eq!(count_ones(&bitmap, 64), 16);
        assert_eq!(count_ones(&[], 64), 0);
    }

    #[test]
    fn test_query_validation() {
        assert!(SpaceQuery::new(4, false, 0, 32).validate().is_ok());
        assert!(SpaceQuery::new(0, false, 0, 32).validate().is_err());
        assert!(SpaceQuery::new(4, false, 0, 32).with_step(0).validate().is_err());
        assert!(SpaceQuery::new(4, false, 33, 32).validate().is_err());
        assert!(SpaceQuery::new(1, false, 0, MAX_BIT_OFFSET + 2).validate().is_err());
    }

    #[test]
    fn test_query_next_candidate() {
        let query = SpaceQuery::new(4, false, 0, 10);
        assert_eq!(query.next_candidate(0), Some(0));
        assert_eq!(query.next_candidate(6), Some(6));
        assert_eq!(query.next_candidate(7), None);

        let stepped = SpaceQuery::new(2, false, 1, 10).with_step(3);
        assert_eq!(stepped.next_candidate(0), Some(1));
        assert_eq!(stepped.next_candidate(2), Some(4));
        assert_eq!(stepped.next_candidate(7), Some(7));
        assert_eq!(stepped.next_candidate(8), None);

        // Window wider than the range
        assert_eq!(SpaceQuery::new(8, false, 0, 4).next_candidate(0), None);
    }

    #[test]
    fn test_decode_offset() {
        assert_eq!(decode_offset(12).unwrap(), Some(12));
        assert_eq!(decode_offset(0).unwrap(), Some(0));
        assert_eq!(decode_offset(NOT_FOUND).unwrap(), None);
        assert!(matches!(decode_offset(-2), Err(Error::Script(_))));
        assert!(matches!(decode_offset(i64::MIN), Err(Error::Script(_))));
    }

    #[test]
    fn test_find_bit_skips_bytes() {
        let bitmap = vec![0xff, 0xff, 0b1110_1111];
        assert_eq!(find_bit(&bitmap, false, 0, 24), Some(19));
        assert_eq!(find_bit(&bitmap, false, 0, 19), None);
        assert_eq!(find_bit(&bitmap, true, 3, 24), Some(3));

        // Bits past the stored value are clear
        assert_eq!(find_bit(&bitmap, false, 20, 40), Some(24));
        assert_eq!(find_bit(&bitmap, true, 24, 40), None);
        assert_eq!(find_bit(&[], false, 5, 6), Some(5));
        assert_eq!(find_bit(&[], false, 5, 5), None);
    }

    #[test]
    fn test_find_window_in_mostly_full_bitmap() {
        // 2^20 bits, all set except 4 bits at the tail
        let mut bitmap = vec![0xff; 1 << 17];
        let last = bitmap.len() - 1;
        bitmap[last] = 0xf0;
        let bits = (bitmap.len() * 8) as u64;

        let query = SpaceQuery::new(4, false, 0, bits);
        assert_eq!(find_window(&bitmap, &query), Some(bits - 4));

        let query = SpaceQuery::new(5, false, 0, bits);
        assert_eq!(find_window(&bitmap, &query), None);
    }

    /// Reference scan: every candidate, every bit
    fn find_window_naive(bitmap: &[u8], query: &SpaceQuery) -> Option<u64> {
        let mut offset = query.start;
        while offset + query.length <= query.end {
            if (offset..offset + query.length).all(|bit| get_bit(bitmap, bit) == query.value) {
                return Some(offset);
            }
            offset += query.step;
        }
        None
    }

    proptest! {
        #[test]
        fn test_find_window_matches_exhaustive_scan(
            bitmap in prop::collection::vec(any::<u8>(), 0..8),
            value in any::<bool>(),
            length in 1u64..6,
            start in 0u64..40,
            span in 0u64..40,
            step in 1u64..5,
        ) {
            let query = SpaceQuery::new(length, value, start, start + span).with_step(step);
            prop_assert_eq!(
                find_window(&bitmap, &query),
                find_window_naive(&bitmap, &query)
            );
        }
    }

    #[test]
    fn test_validate_fill() {
        assert!(validate_fill(5, 3).is_ok());
        assert!(validate_fill(u64::MAX, 0).is_ok());
        assert!(validate_fill(MAX_BIT_OFFSET, 1).is_ok());
        assert!(validate_fill(MAX_BIT_OFFSET, 2).is_err());
        assert!(validate_fill(u64::MAX, 2).is_err());
    }
}
