//! Value types for the address and route allocation engine.
//!
//! This crate provides type-safe representations of the network primitives
//! the allocator hands out and reasons about:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses, convertible to integers
//! - [`MacRange`]: a MAC prefix range parsed by [`parse_mac_range`]
//! - [`IpPrefix`]: IPv4/IPv6 networks (CIDR notation) with containment checks
//! - [`IpVersion`]: the address family of a prefix or address

mod ip;
mod mac;
mod mac_range;

pub use ip::{addr_to_u128, overlaps, IpPrefix, IpVersion};
pub use mac::MacAddress;
pub use mac_range::{parse_mac_range, MacRange};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid MAC address range: {0}")]
    InvalidMacRange(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid IP version: {0} (must be 4 or 6)")]
    InvalidIpVersion(u8),
}
