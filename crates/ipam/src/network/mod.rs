//! CIDR block arithmetic
//!
//! [`NetworkAddressSpace`] is an owned value (base address + prefix length)
//! that maps addresses to zero-based positions inside the block and back.
//! Both allocators index their bitmaps with these positions.

pub mod arith;

pub use arith::{decrement, delta, increment, is_public_ip};

use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::FusedIterator;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IPv4 blocks up to this prefix have distinct network and broadcast addresses
const IPV4_MAX_RESERVING_PREFIX: u8 = 30;

/// A parsed CIDR block
///
/// Positions run from `0` (the base address) to `address_count() - 1` (the
/// last address of the block). The mapping is bijective and order-preserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkAddressSpace {
    base: IpAddr,
    prefix_len: u8,
}

impl NetworkAddressSpace {
    /// Build a block from an address and prefix length
    ///
    /// Host bits of `addr` are truncated, so `192.168.1.5/29` becomes
    /// `192.168.1.0/29`.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let net = IpNet::new(addr, prefix_len)?.trunc();
        Ok(Self::from(net))
    }

    /// Parse a CIDR string such as `10.0.0.0/24` or `2001:db8::/64`
    pub fn parse(cidr: &str) -> Result<Self> {
        let net: IpNet = cidr
            .trim()
            .parse()
            .map_err(|e: ipnet::AddrParseError| Error::InvalidCidr(format!("{}: {}", cidr, e)))?;
        Ok(Self::from(net.trunc()))
    }

    /// First address of the block (the network address for IPv4)
    pub fn base_address(&self) -> IpAddr {
        self.base
    }

    /// Prefix length
    pub fn mask_size(&self) -> u8 {
        self.prefix_len
    }

    /// Number of host bits
    pub fn host_bits(&self) -> u8 {
        arith::bit_width(&self.base) - self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.base.is_ipv4()
    }

    /// `2^host_bits`
    ///
    /// `::/0` holds 2^128 addresses, which saturates to `u128::MAX`.
    pub fn address_count(&self) -> u128 {
        1u128.checked_shl(u32::from(self.host_bits())).unwrap_or(u128::MAX)
    }

    /// Offset of the last address of the block
    fn last_position(&self) -> u128 {
        match 1u128.checked_shl(u32::from(self.host_bits())) {
            Some(count) => count - 1,
            None => u128::MAX,
        }
    }

    /// Subnet mask in address form, e.g. `255.255.255.248` for a /29
    pub fn netmask(&self) -> IpAddr {
        match self.base {
            IpAddr::V4(_) => {
                let mask = u32::MAX
                    .checked_shl(u32::from(32 - self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(mask))
            }
            IpAddr::V6(_) => {
                let mask = u128::MAX
                    .checked_shl(u32::from(128 - self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(mask))
            }
        }
    }

    /// Whether `addr` lies inside the block
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.position_of(addr).is_some()
    }

    /// Zero-based offset of `addr` from the base address
    ///
    /// `None` if `addr` is outside the block or of the other family.
    pub fn position_of(&self, addr: IpAddr) -> Option<u128> {
        arith::delta(self.base, addr).filter(|&pos| pos <= self.last_position())
    }

    /// Address at zero-based `position`, the inverse of [`position_of`](Self::position_of)
    pub fn address_at(&self, position: u128) -> Option<IpAddr> {
        if position > self.last_position() {
            return None;
        }
        arith::increment(self.base, position)
    }

    /// Address by 1-based ordinal counted from the base address
    ///
    /// Ordinals `0` and `1` both name the base address, ordinal `n` names
    /// position `n - 1`.
    pub fn address_by_ordinal(&self, ordinal: u128) -> Option<IpAddr> {
        self.address_at(ordinal.saturating_sub(1))
    }

    /// Address by 1-based ordinal counted back from [`last_address`](Self::last_address)
    ///
    /// Ordinals `0` and `1` both name the last usable host, so the broadcast
    /// address of a reserving IPv4 block is never returned.
    pub fn address_by_ordinal_reverse(&self, ordinal: u128) -> Option<IpAddr> {
        let back = ordinal.saturating_sub(1);
        self.position_of(self.last_address())?
            .checked_sub(back)
            .and_then(|pos| self.address_at(pos))
    }

    /// Whether this block sets aside a network and a broadcast address
    fn reserves_endpoints(&self) -> bool {
        self.is_ipv4() && self.prefix_len <= IPV4_MAX_RESERVING_PREFIX
    }

    /// Network address, only for IPv4 blocks of /30 or larger
    pub fn network_address(&self) -> Option<IpAddr> {
        self.reserves_endpoints().then_some(self.base)
    }

    /// Broadcast address, only for IPv4 blocks of /30 or larger
    pub fn broadcast_address(&self) -> Option<IpAddr> {
        if !self.reserves_endpoints() {
            return None;
        }
        self.address_at(self.last_position())
    }

    /// Positions pre-marked as used by allocators
    pub fn reserved_positions(&self) -> Vec<u128> {
        if self.reserves_endpoints() {
            vec![0, self.last_position()]
        } else {
            Vec::new()
        }
    }

    pub fn is_reserved_position(&self, position: u128) -> bool {
        self.reserves_endpoints() && (position == 0 || position == self.last_position())
    }

    /// First usable host address
    ///
    /// For IPv4 blocks of /30 or larger this skips the network address.
    pub fn first_address(&self) -> IpAddr {
        if self.reserves_endpoints() {
            arith::increment(self.base, 1).unwrap_or(self.base)
        } else {
            self.base
        }
    }

    /// Last usable host address
    ///
    /// For IPv4 blocks of /30 or larger this stops before the broadcast
    /// address.
    pub fn last_address(&self) -> IpAddr {
        let last = self.last_position();
        let pos = if self.reserves_endpoints() { last - 1 } else { last };
        arith::increment(self.base, pos).unwrap_or(self.base)
    }

    /// Lazily enumerate every address from [`first_address`](Self::first_address)
    /// to [`last_address`](Self::last_address), inclusive
    ///
    /// Each call starts a fresh sequence, and the iterator can be cloned to
    /// restart from its current point.
    pub fn hosts(&self) -> HostIter {
        HostIter {
            family: self.base,
            next: Some(arith::to_u128(self.first_address())),
            last: arith::to_u128(self.last_address()),
        }
    }
}

impl From<IpNet> for NetworkAddressSpace {
    fn from(net: IpNet) -> Self {
        Self {
            base: net.network(),
            prefix_len: net.prefix_len(),
        }
    }
}

impl FromStr for NetworkAddressSpace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NetworkAddressSpace {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NetworkAddressSpace> for String {
    fn from(space: NetworkAddressSpace) -> Self {
        space.to_string()
    }
}

impl fmt::Display for NetworkAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix_len)
    }
}

/// Iterator over the usable host range of a block
#[derive(Debug, Clone)]
pub struct HostIter {
    family: IpAddr,
    next: Option<u128>,
    last: u128,
}

impl Iterator for HostIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = if current < self.last {
            Some(current + 1)
        } else {
            None
        };
        arith::from_u128(&self.family, current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            None => (0, Some(0)),
            Some(next) => {
                let remaining = (self.last - next).checked_add(1);
                match remaining.and_then(|r| usize::try_from(r).ok()) {
                    Some(n) => (n, Some(n)),
                    None => (usize::MAX, None),
                }
            }
        }
    }
}

impl FusedIterator for HostIter {}
