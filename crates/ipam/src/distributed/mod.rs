//! Allocation state shared across processes
//!
//! Builds on the [`store`](crate::store) primitives:
//! - [`DistributedIpAllocator`] maps a network onto a shared bitmap key
//! - [`LockRegistry`] provides named mutexes for multi-step workflows

mod allocator;
pub mod lock;

pub use allocator::DistributedIpAllocator;
pub use lock::{DistributedMutex, LockRegistry};
