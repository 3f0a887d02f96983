//! IP prefix and version types with containment arithmetic.

use crate::ParseError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// The address family of a prefix or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Returns the version of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Address width in bits.
    pub const fn bits(&self) -> u8 {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }

    /// Builds an address of this version from its integer value.
    ///
    /// Returns `None` if the value does not fit the address width.
    pub fn addr_from_u128(&self, value: u128) -> Option<IpAddr> {
        match self {
            IpVersion::V4 => u32::try_from(value)
                .ok()
                .map(|v| IpAddr::V4(Ipv4Addr::from(v))),
            IpVersion::V6 => Some(IpAddr::V6(Ipv6Addr::from(value))),
        }
    }
}

/// Returns the integer value of an address.
pub fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<IpVersion> for u8 {
    fn from(version: IpVersion) -> u8 {
        match version {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(ParseError::InvalidIpVersion(other)),
        }
    }
}

/// An IP network in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// Host bits are cleared on construction, so `10.0.0.7/24` and
/// `10.0.0.0/24` are the same prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    network: IpNetwork,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let raw = IpNetwork::new(address, prefix_len).map_err(|e| {
            ParseError::InvalidIpPrefix(format!("{}/{}: {}", address, prefix_len, e))
        })?;
        let network = IpNetwork::new(raw.network(), prefix_len).map_err(|e| {
            ParseError::InvalidIpPrefix(format!("{}/{}: {}", address, prefix_len, e))
        })?;
        Ok(IpPrefix { network })
    }

    /// The wildcard network (`0.0.0.0/0` or `::/0`) for a version.
    pub fn wildcard(version: IpVersion) -> Self {
        let unspecified = match version {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        IpPrefix {
            // a zero-length prefix is valid for both families
            network: IpNetwork::new(unspecified, 0).unwrap_or_else(|_| unreachable!()),
        }
    }

    /// Returns the network address of this prefix.
    pub fn network(&self) -> IpAddr {
        self.network.network()
    }

    /// Returns the prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix()
    }

    /// Returns the address family.
    pub fn version(&self) -> IpVersion {
        IpVersion::of(&self.network.ip())
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len() == 0
    }

    /// Number of addresses in the prefix, saturating at `u128::MAX` for `::/0`.
    pub fn size(&self) -> u128 {
        let host_bits = u32::from(self.version().bits() - self.prefix_len());
        1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
    }

    /// Integer value of the first (network) address.
    pub fn first(&self) -> u128 {
        addr_to_u128(&self.network())
    }

    /// Integer value of the last address (inclusive).
    pub fn last(&self) -> u128 {
        self.first().saturating_add(self.size() - 1)
    }

    /// Returns the address at `offset` from the network address, if inside.
    pub fn nth(&self, offset: u128) -> Option<IpAddr> {
        if offset >= self.size() {
            return None;
        }
        self.version().addr_from_u128(self.first() + offset)
    }

    /// Returns true if the address lies inside this prefix.
    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        IpVersion::of(addr) == self.version() && self.network.contains(*addr)
    }

    /// Returns true if `other` is equal to or a subset of this prefix.
    pub fn contains(&self, other: &IpPrefix) -> bool {
        self.version() == other.version()
            && self.prefix_len() <= other.prefix_len()
            && self.network.contains(other.network())
    }

    /// Returns true if either prefix contains the other.
    pub fn overlaps(&self, other: &IpPrefix) -> bool {
        self.contains(other) || other.contains(self)
    }
}

/// Conflict predicate for route destinations: true when either network is
/// a subset (inclusive) of the other. Symmetric; different families never
/// overlap.
pub fn overlaps(a: &IpPrefix, b: &IpPrefix) -> bool {
    a.overlaps(b)
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}
