//! In-process IP address allocator
//!
//! Tracks address occupancy for one CIDR block in a bitset.
//! All state sits behind a single mutex, so the allocator is `Send + Sync`
//! and can be shared through an `Arc`.

use super::bitset::AddressBitset;
use crate::config::LocalAllocatorConfig;
use crate::network::NetworkAddressSpace;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::IpAddr;
use tracing::{debug, trace};

/// Bitset-backed allocator for a single network
///
/// The IPv4 network and broadcast addresses (blocks /30 and larger) are
/// marked used at construction and are never handed out.
///
/// [`find_available_ip_and_use`](Self::find_available_ip_and_use) is the only
/// call that is atomic across "find" and "use". Calling
/// [`find_available_ip`](Self::find_available_ip) and then
/// [`use_ip`](Self::use_ip) lets two callers receive the same address.
#[derive(Debug)]
pub struct LocalBitsetAllocator {
    /// Network block
    network: NetworkAddressSpace,
    /// One bit per position, set = in use
    used: Mutex<AddressBitset>,
}

impl LocalBitsetAllocator {
    /// Create an allocator with the default size limit
    pub fn new(network: NetworkAddressSpace) -> Result<Self> {
        Self::with_config(network, &LocalAllocatorConfig::default())
    }

    /// Create an allocator with a custom size limit
    pub fn with_config(network: NetworkAddressSpace, config: &LocalAllocatorConfig) -> Result<Self> {
        let max = config.effective_max_host_bits();
        if network.host_bits() > max {
            return Err(Error::BlockTooLarge {
                cidr: network.to_string(),
                host_bits: network.host_bits(),
                max,
            });
        }

        // host_bits <= 31, so the count fits in usize on every supported target
        let len = usize::try_from(network.address_count())
            .map_err(|_| Error::Config(format!("{} does not fit in memory", network)))?;

        let mut used = AddressBitset::new(len);
        for pos in network.reserved_positions() {
            used.set(pos as usize);
        }

        debug!(
            network = %network,
            addresses = len,
            reserved = used.count_ones(),
            "Created local IP allocator"
        );

        Ok(Self {
            network,
            used: Mutex::new(used),
        })
    }

    /// Parse `cidr` and create an allocator for it
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        Self::new(NetworkAddressSpace::parse(cidr)?)
    }

    /// Restore allocator state from persisted allocations
    pub fn with_used(self, addresses: &[IpAddr]) -> Result<Self> {
        for ip in addresses {
            self.use_ip(*ip)?;
        }
        Ok(self)
    }

    /// The network block this allocator manages
    pub fn network(&self) -> &NetworkAddressSpace {
        &self.network
    }

    /// Lowest free address, without marking it used
    pub fn find_available_ip(&self) -> Result<IpAddr> {
        let used = self.used.lock();
        self.first_free(&used).map(|(_, ip)| ip)
    }

    /// Lowest free address, marked used before the lock is released
    pub fn find_available_ip_and_use(&self) -> Result<IpAddr> {
        let mut used = self.used.lock();
        let (pos, ip) = self.first_free(&used)?;
        used.set(pos);

        trace!(network = %self.network, ip = %ip, "Allocated IP");
        Ok(ip)
    }

    /// Mark `ip` as used. Marking an already used address is a no-op.
    pub fn use_ip(&self, ip: IpAddr) -> Result<()> {
        let pos = self.position(ip)?;
        self.used.lock().set(pos);
        Ok(())
    }

    /// Mark `ip` as free. Freeing an already free address is a no-op.
    ///
    /// The network and broadcast addresses cannot be freed.
    pub fn un_use_ip(&self, ip: IpAddr) -> Result<()> {
        let pos = self.position(ip)?;
        if self.network.is_reserved_position(pos as u128) {
            return Err(Error::ReservedAddress(ip));
        }
        self.used.lock().clear(pos);
        Ok(())
    }

    /// [`use_ip`](Self::use_ip) for a textual address
    pub fn use_ip_str(&self, ip: &str) -> Result<()> {
        self.use_ip(parse_ip(ip)?)
    }

    /// [`un_use_ip`](Self::un_use_ip) for a textual address
    pub fn un_use_ip_str(&self, ip: &str) -> Result<()> {
        self.un_use_ip(parse_ip(ip)?)
    }

    /// Whether `ip` is marked used (reserved addresses count as used)
    pub fn is_used(&self, ip: IpAddr) -> Result<bool> {
        let pos = self.position(ip)?;
        Ok(self.used.lock().test(pos))
    }

    /// Number of used positions, reserved ones included
    pub fn used_count(&self) -> u32 {
        self.used.lock().count_ones() as u32
    }

    /// Number of free positions
    pub fn available_count(&self) -> u32 {
        self.used.lock().count_zeros() as u32
    }

    /// All used addresses in ascending order, reserved ones included
    pub fn used_addresses(&self) -> Vec<IpAddr> {
        let used = self.used.lock();
        used.iter_ones()
            .filter_map(|pos| self.network.address_at(pos as u128))
            .collect()
    }

    fn first_free(&self, used: &AddressBitset) -> Result<(usize, IpAddr)> {
        used.next_clear(0)
            .and_then(|pos| self.network.address_at(pos as u128).map(|ip| (pos, ip)))
            .ok_or_else(|| Error::NoAddressAvailable(self.network.to_string()))
    }

    fn position(&self, ip: IpAddr) -> Result<usize> {
        self.network
            .position_of(ip)
            .map(|pos| pos as usize)
            .ok_or_else(|| Error::AddressOutOfRange(ip, self.network.to_string()))
    }
}

fn parse_ip(ip: &str) -> Result<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| Error::InvalidAddress(format!("{}: {}", ip, e)))
}
