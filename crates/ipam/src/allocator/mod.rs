//! In-process address allocation
//!
//! Provides:
//! - A word-backed bitset over address positions
//! - A mutex-guarded allocator for one CIDR block

pub mod bitset;
mod ip_allocator;

pub use bitset::AddressBitset;
pub use ip_allocator::LocalBitsetAllocator;
