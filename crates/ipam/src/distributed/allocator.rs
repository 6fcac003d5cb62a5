//! IP allocation against a shared bitmap
//!
//! Bit `n` of the bitmap under `key` is position `n` of the network, using
//! the same numbering as [`LocalBitsetAllocator`](crate::allocator::LocalBitsetAllocator).
//! Any number of processes can hold a `DistributedIpAllocator` for the same
//! key; the store keeps them consistent.

use crate::network::NetworkAddressSpace;
use crate::store::{count_ones, get_bit, BitmapStore, SpaceQuery, MAX_BIT_OFFSET};
use crate::{Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Store-backed allocator for one network
///
/// Allocation goes through [`BitmapStore::find_and_fill`], so concurrent
/// callers in different processes never receive the same address.
pub struct DistributedIpAllocator {
    /// Network block
    network: NetworkAddressSpace,
    /// Bitmap key in the store
    key: String,
    /// Shared store
    store: Arc<dyn BitmapStore>,
}

impl DistributedIpAllocator {
    /// Bind a network to a bitmap key without touching the store
    ///
    /// Call [`initialize`](Self::initialize) (or use [`open`](Self::open))
    /// before allocating so the reserved positions are marked.
    pub fn new(
        network: NetworkAddressSpace,
        key: impl Into<String>,
        store: Arc<dyn BitmapStore>,
    ) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::InvalidArgument("bitmap key must not be empty".into()));
        }
        if network.address_count() > u128::from(MAX_BIT_OFFSET) + 1 {
            return Err(Error::BlockTooLarge {
                cidr: network.to_string(),
                host_bits: network.host_bits(),
                max: 32,
            });
        }

        Ok(Self {
            network,
            key,
            store,
        })
    }

    /// Bind and mark the reserved positions
    pub async fn open(
        network: NetworkAddressSpace,
        key: impl Into<String>,
        store: Arc<dyn BitmapStore>,
    ) -> Result<Self> {
        let allocator = Self::new(network, key, store)?;
        allocator.initialize().await?;
        Ok(allocator)
    }

    pub fn network(&self) -> &NetworkAddressSpace {
        &self.network
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of bits in the bitmap (fits in u64, checked in `new`)
    fn bit_len(&self) -> u64 {
        self.network.address_count() as u64
    }

    /// Mark the network and broadcast positions used. Safe to repeat.
    #[instrument(skip(self), fields(network = %self.network, key = %self.key))]
    pub async fn initialize(&self) -> Result<()> {
        for pos in self.network.reserved_positions() {
            self.store.fill(&self.key, true, pos as u64, 1).await?;
        }
        info!("Initialized shared address bitmap");
        Ok(())
    }

    /// Claim the lowest free address
    #[instrument(skip(self), fields(network = %self.network, key = %self.key))]
    pub async fn allocate(&self) -> Result<IpAddr> {
        let mut addresses = self.allocate_range(1).await?;
        addresses
            .pop()
            .ok_or_else(|| Error::NoAddressAvailable(self.network.to_string()))
    }

    /// Claim the lowest run of `count` consecutive free addresses
    #[instrument(skip(self), fields(network = %self.network, key = %self.key))]
    pub async fn allocate_range(&self, count: u64) -> Result<Vec<IpAddr>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let query = SpaceQuery::new(count, false, 0, self.bit_len());
        let offset = self
            .store
            .find_and_fill(&self.key, &query)
            .await?
            .ok_or_else(|| Error::NoAddressAvailable(self.network.to_string()))?;

        let addresses = (offset..offset + count)
            .filter_map(|pos| self.network.address_at(u128::from(pos)))
            .collect::<Vec<_>>();

        debug!(offset, count, "Claimed addresses");
        Ok(addresses)
    }

    /// Mark `ip` used. Idempotent.
    pub async fn use_ip(&self, ip: IpAddr) -> Result<()> {
        let pos = self.position(ip)?;
        self.store.fill(&self.key, true, pos, 1).await?;
        Ok(())
    }

    /// Mark `ip` free. Idempotent; reserved addresses are rejected.
    pub async fn release(&self, ip: IpAddr) -> Result<()> {
        let pos = self.position(ip)?;
        if self.network.is_reserved_position(u128::from(pos)) {
            return Err(Error::ReservedAddress(ip));
        }
        self.store.fill(&self.key, false, pos, 1).await?;
        debug!(ip = %ip, "Released address");
        Ok(())
    }

    /// Whether `ip` is marked used
    pub async fn is_used(&self, ip: IpAddr) -> Result<bool> {
        let pos = self.position(ip)?;
        let bitmap = self.store.read(&self.key).await?;
        Ok(get_bit(&bitmap, pos))
    }

    /// Used positions, from one snapshot of the bitmap
    pub async fn used_count(&self) -> Result<u64> {
        let bitmap = self.store.read(&self.key).await?;
        Ok(count_ones(&bitmap, self.bit_len()))
    }

    /// Free positions, from one snapshot of the bitmap
    pub async fn available_count(&self) -> Result<u64> {
        Ok(self.bit_len() - self.used_count().await?)
    }

    /// Used addresses in ascending order, from one snapshot of the bitmap
    pub async fn used_addresses(&self) -> Result<Vec<IpAddr>> {
        let bitmap = self.store.read(&self.key).await?;
        Ok((0..self.bit_len().min(bitmap.len() as u64 * 8))
            .filter(|&pos| get_bit(&bitmap, pos))
            .filter_map(|pos| self.network.address_at(u128::from(pos)))
            .collect())
    }

    /// Drop all allocation state and re-mark the reserved positions
    pub async fn reset(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        self.initialize().await
    }

    fn position(&self, ip: IpAddr) -> Result<u64> {
        self.network
            .position_of(ip)
            .map(|pos| pos as u64)
            .ok_or_else(|| Error::AddressOutOfRange(ip, self.network.to_string()))
    }
}

impl std::fmt::Debug for DistributedIpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedIpAllocator")
            .field("network", &self.network)
            .field("key", &self.key)
            .field("store", &self.store.store_type())
            .finish()
    }
}
