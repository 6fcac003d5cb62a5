//! Error types for address allocation

use std::net::IpAddr;
use thiserror::Error;

/// Result type for allocation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Allocation engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // CIDR errors
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("Network {cidr} has {host_bits} host bits, allocator limit is {max}")]
    BlockTooLarge { cidr: String, host_bits: u8, max: u8 },

    // IP allocation errors
    #[error("No IP address available in {0}")]
    NoAddressAvailable(String),

    #[error("IP {0} is not in network {1}")]
    AddressOutOfRange(IpAddr, String),

    #[error("IP {0} is reserved")]
    ReservedAddress(IpAddr),

    // Store errors
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Store script error: {0}")]
    Script(String),

    // Lock errors
    #[error("Lock {0} could not be acquired")]
    LockNotAcquired(String),

    // General errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidAddress(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
            Error::Transport(e.to_string())
        } else {
            Error::Script(e.to_string())
        }
    }
}
