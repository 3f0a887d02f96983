//! Persisted record types.
//!
//! Addresses are stored as integers; 128-bit values are serialized as
//! decimal strings because JSON numbers cannot carry them.

use crate::ids::new_id;
use crate::Record;
use chrono::{DateTime, Utc};
use netalloc_types::{IpPrefix, IpVersion};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Serializes integers wider than 64 bits as decimal strings.
mod wide_int {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// A range of subnet-relative addresses that is never handed out
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpExclusion {
    /// Offset from the first address of the subnet; negative values count
    /// back from one past the last address.
    #[serde(with = "wide_int")]
    pub offset: i128,
    /// Number of excluded addresses.
    #[serde(with = "wide_int")]
    pub length: u128,
}

/// Set of exclusions applied to automatic assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPolicy {
    pub exclusions: Vec<IpExclusion>,
}

impl IpPolicy {
    /// Creates a policy from `(offset, length)` pairs.
    pub fn new(exclusions: impl IntoIterator<Item = (i128, u128)>) -> Self {
        Self {
            exclusions: exclusions
                .into_iter()
                .map(|(offset, length)| IpExclusion { offset, length })
                .collect(),
        }
    }
}

/// A virtual network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    /// Applies to every subnet without a policy of its own.
    pub ip_policy: Option<IpPolicy>,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            ip_policy: None,
        }
    }
}

impl Record for Network {
    const TABLE: &'static str = "networks";

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// An IP subnet and its automatic-assignment cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub name: String,
    pub cidr: IpPrefix,
    pub ip_version: IpVersion,
    /// Next integer address to try when minting.
    #[serde(with = "wide_int")]
    pub next_auto_assign_ip: u128,
    pub ip_policy: Option<IpPolicy>,
    pub created_at: DateTime<Utc>,
}

impl Subnet {
    pub fn new(network_id: impl Into<String>, cidr: IpPrefix, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            network_id: network_id.into(),
            name: String::new(),
            cidr,
            ip_version: cidr.version(),
            next_auto_assign_ip: cidr.first(),
            ip_policy: None,
            created_at,
        }
    }

    /// Index key for the subnets of a network.
    pub fn by_network(network_id: &str) -> String {
        format!("network:{}", network_id)
    }
}

impl Record for Subnet {
    const TABLE: &'static str = "subnets";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_keys(&self) -> Vec<String> {
        vec![Self::by_network(&self.network_id)]
    }
}

/// A host route attached to a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub subnet_id: String,
    /// Destination network.
    pub cidr: IpPrefix,
    pub gateway: IpAddr,
}

impl Route {
    pub fn new(subnet_id: impl Into<String>, cidr: IpPrefix, gateway: IpAddr) -> Self {
        Self {
            id: new_id(),
            subnet_id: subnet_id.into(),
            cidr,
            gateway,
        }
    }

    /// Index key for the routes of a subnet.
    pub fn by_subnet(subnet_id: &str) -> String {
        format!("subnet:{}", subnet_id)
    }
}

impl Record for Route {
    const TABLE: &'static str = "routes";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_keys(&self) -> Vec<String> {
        vec![Self::by_subnet(&self.subnet_id)]
    }
}

/// A DNS nameserver advertised on a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsNameserver {
    pub id: String,
    pub subnet_id: String,
    pub ip: IpAddr,
}

impl DnsNameserver {
    pub fn new(subnet_id: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            id: new_id(),
            subnet_id: subnet_id.into(),
            ip,
        }
    }

    pub fn by_subnet(subnet_id: &str) -> String {
        format!("subnet:{}", subnet_id)
    }
}

impl Record for DnsNameserver {
    const TABLE: &'static str = "dns_nameservers";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_keys(&self) -> Vec<String> {
        vec![Self::by_subnet(&self.subnet_id)]
    }
}

/// A pool of MAC addresses, `[first_address, last_address)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddressRange {
    pub id: String,
    /// Canonical text form, e.g. `AA:BB:CC:00:00:00/24`.
    pub cidr: String,
    pub first_address: u64,
    pub last_address: u64,
    /// Next integer address to try when minting.
    pub next_auto_assign_mac: u64,
    pub created_at: DateTime<Utc>,
}

impl MacAddressRange {
    pub fn new(
        cidr: impl Into<String>,
        first_address: u64,
        last_address: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            cidr: cidr.into(),
            first_address,
            last_address,
            next_auto_assign_mac: first_address,
            created_at,
        }
    }

    /// Number of addresses the range can hold.
    pub fn capacity(&self) -> u64 {
        self.last_address.saturating_sub(self.first_address)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.first_address && address < self.last_address
    }
}

impl Record for MacAddressRange {
    const TABLE: &'static str = "mac_address_ranges";

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// A MAC address that has been handed out at least once.
///
/// Rows are never removed; a deallocated row is reused after the cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddressEntry {
    pub address: u64,
    pub mac_range_id: String,
    pub deallocated: bool,
    pub deallocated_at: Option<DateTime<Utc>>,
}

impl MacAddressEntry {
    pub fn new(address: u64, mac_range_id: impl Into<String>) -> Self {
        Self {
            address,
            mac_range_id: mac_range_id.into(),
            deallocated: false,
            deallocated_at: None,
        }
    }

    /// Primary key of an address.
    pub fn key_for(address: u64) -> String {
        format!("{:012x}", address)
    }

    pub fn by_range(range_id: &str) -> String {
        format!("range:{}", range_id)
    }
}

impl Record for MacAddressEntry {
    const TABLE: &'static str = "mac_addresses";

    fn key(&self) -> String {
        Self::key_for(self.address)
    }

    fn index_keys(&self) -> Vec<String> {
        vec![Self::by_range(&self.mac_range_id)]
    }
}

/// An IP address that has been handed out at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressEntry {
    pub id: String,
    #[serde(with = "wide_int")]
    pub address: u128,
    pub subnet_id: String,
    pub network_id: String,
    pub version: IpVersion,
    pub deallocated: bool,
    pub deallocated_at: Option<DateTime<Utc>>,
    pub allocated_at: DateTime<Utc>,
}

impl IpAddressEntry {
    pub fn new(subnet: &Subnet, address: u128, allocated_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            address,
            subnet_id: subnet.id.clone(),
            network_id: subnet.network_id.clone(),
            version: subnet.ip_version,
            deallocated: false,
            deallocated_at: None,
            allocated_at,
        }
    }

    /// Returns the address in its family's text form.
    pub fn ip(&self) -> Option<IpAddr> {
        self.version.addr_from_u128(self.address)
    }

    /// Unique key of an address within a network.
    pub fn unique_key_for(network_id: &str, address: u128) -> String {
        format!("{}/{}", network_id, address)
    }

    pub fn by_subnet(subnet_id: &str) -> String {
        format!("subnet:{}", subnet_id)
    }

    pub fn by_network(network_id: &str) -> String {
        format!("network:{}", network_id)
    }
}

impl Record for IpAddressEntry {
    const TABLE: &'static str = "ip_addresses";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn unique_key(&self) -> Option<String> {
        Some(Self::unique_key_for(&self.network_id, self.address))
    }

    fn index_keys(&self) -> Vec<String> {
        vec![
            Self::by_subnet(&self.subnet_id),
            Self::by_network(&self.network_id),
        ]
    }
}

/// Association between a port and an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortIpAddress {
    pub port_id: String,
    pub ip_address_id: String,
}

impl PortIpAddress {
    pub fn new(port_id: impl Into<String>, ip_address_id: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            ip_address_id: ip_address_id.into(),
        }
    }

    pub fn key_for(port_id: &str, ip_address_id: &str) -> String {
        format!("{}:{}", port_id, ip_address_id)
    }

    pub fn by_port(port_id: &str) -> String {
        format!("port:{}", port_id)
    }

    pub fn by_ip(ip_address_id: &str) -> String {
        format!("ip:{}", ip_address_id)
    }
}

impl Record for PortIpAddress {
    const TABLE: &'static str = "port_ip_addresses";

    fn key(&self) -> String {
        Self::key_for(&self.port_id, &self.ip_address_id)
    }

    fn index_keys(&self) -> Vec<String> {
        vec![Self::by_port(&self.port_id), Self::by_ip(&self.ip_address_id)]
    }
}
