//! Integer arithmetic over IP addresses
//!
//! Addresses are widened to `u128` so IPv4 and IPv6 share one code path.
//! Results never cross families: incrementing past `255.255.255.255` is an
//! overflow, not a wrap into IPv6 space.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address width in bits for the family of `ip`
pub fn bit_width(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Widen an address to its integer value
pub fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Narrow an integer back to an address of the same family as `family`
///
/// Returns `None` if the value does not fit the family.
pub fn from_u128(family: &IpAddr, value: u128) -> Option<IpAddr> {
    match family {
        IpAddr::V4(_) => u32::try_from(value)
            .ok()
            .map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpAddr::V6(_) => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// `ip + by`, or `None` on overflow
pub fn increment(ip: IpAddr, by: u128) -> Option<IpAddr> {
    to_u128(ip)
        .checked_add(by)
        .and_then(|v| from_u128(&ip, v))
}

/// `ip - by`, or `None` on underflow
pub fn decrement(ip: IpAddr, by: u128) -> Option<IpAddr> {
    to_u128(ip)
        .checked_sub(by)
        .and_then(|v| from_u128(&ip, v))
}

/// Distance from `from` up to `to`
///
/// `None` if the families differ or `to` is below `from`.
pub fn delta(from: IpAddr, to: IpAddr) -> Option<u128> {
    if from.is_ipv4() != to.is_ipv4() {
        return None;
    }
    to_u128(to).checked_sub(to_u128(from))
}

/// Whether an address is routable outside the local host/link
///
/// Loopback, link-local unicast and link-local multicast addresses are not
/// public. IPv4-mapped IPv6 addresses are judged by their IPv4 form.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let link_local_multicast = v4.octets()[..3] == [224, 0, 0];
            !(v4.is_loopback() || v4.is_link_local() || link_local_multicast)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let link_local_unicast = first & 0xffc0 == 0xfe80;
            let link_local_multicast = first & 0xff0f == 0xff02;
            !(v6.is_loopback() || link_local_unicast || link_local_multicast)
        }
    }
}
