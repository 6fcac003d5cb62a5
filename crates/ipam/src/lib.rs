//! IP Address Allocation
//!
//! Tracks which addresses of a CIDR block are in use and hands out free ones:
//! - [`NetworkAddressSpace`]: CIDR parsing and address/position arithmetic
//! - [`LocalBitsetAllocator`]: in-process allocator, atomic per call under a mutex
//! - [`BitmapStore`]: atomic fill / window-scan primitives over a shared bitmap
//! - [`DistributedIpAllocator`]: the allocator surface on top of a shared store
//! - [`LockRegistry`]: named distributed mutexes for multi-step workflows
//!
//! Positions are zero-based offsets from the block's base address. The local
//! bitset and the shared bitmap use the same numbering, so bit `n` always
//! means `network.address_at(n)`.
//!
//! # Example
//!
//! ```
//! use ipam::LocalBitsetAllocator;
//!
//! let allocator = LocalBitsetAllocator::from_cidr("192.168.1.0/29").unwrap();
//! assert_eq!(allocator.used_count(), 2); // network + broadcast
//!
//! let ip = allocator.find_available_ip_and_use().unwrap();
//! assert_eq!(ip.to_string(), "192.168.1.1");
//! ```

pub mod allocator;
pub mod config;
pub mod distributed;
pub mod error;
pub mod network;
pub mod store;

// Re-export core types
pub use allocator::{AddressBitset, LocalBitsetAllocator};
pub use config::{LocalAllocatorConfig, LockOptions, RedisStoreConfig};
pub use distributed::{DistributedIpAllocator, DistributedMutex, LockRegistry};
pub use error::{Error, Result};
pub use network::{is_public_ip, NetworkAddressSpace};
pub use store::{BitmapStore, InMemoryStore, LockStore, SpaceQuery, StoreType};

#[cfg(feature = "redis")]
pub use store::RedisStore;
