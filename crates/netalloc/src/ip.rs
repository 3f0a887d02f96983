//! IP address allocation from subnet pools.
//!
//! Automatic requests reuse the lowest cooled-down address on the network
//! before minting a fresh one. Minting walks the chosen subnet from its
//! cursor, skipping policy exclusions and addresses that already have a row.
//! Explicit requests bypass the policy and may attach a port to an address
//! that is already in use.

use crate::clock::cooled_down;
use crate::error::{AllocError, AllocResult};
use crate::policy::{effective_policy, ExcludedRanges};
use chrono::{DateTime, Utc};
use netalloc_store::records::{IpAddressEntry, Network, PortIpAddress, Subnet};
use netalloc_store::{Record, Transaction};
use netalloc_types::{addr_to_u128, IpVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stale rows (address outside their subnet) removed per reuse attempt
/// before giving up on reuse.
const MAX_STALE_RECLAIMS: usize = 3;

/// How many addresses, and of which versions, a port receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpamStrategy {
    /// One address of any version, IPv4 preferred.
    #[default]
    Any,
    /// One address per version where available, at least one overall.
    Both,
    /// Exactly one IPv4 and one IPv6 address.
    BothRequired,
}

impl fmt::Display for IpamStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpamStrategy::Any => write!(f, "ANY"),
            IpamStrategy::Both => write!(f, "BOTH"),
            IpamStrategy::BothRequired => write!(f, "BOTH_REQUIRED"),
        }
    }
}

impl FromStr for IpamStrategy {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANY" => Ok(IpamStrategy::Any),
            "BOTH" => Ok(IpamStrategy::Both),
            "BOTH_REQUIRED" => Ok(IpamStrategy::BothRequired),
            other => Err(AllocError::config(format!("unknown IPAM strategy {}", other))),
        }
    }
}

/// Parameters of one IP allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateIpRequest {
    pub network_id: String,
    pub port_id: String,
    /// Restricts the allocation to one address family.
    pub version: Option<IpVersion>,
    /// Asks for this exact address.
    pub ip_address: Option<IpAddr>,
}

impl AllocateIpRequest {
    pub fn new(network_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            port_id: port_id.into(),
            version: None,
            ip_address: None,
        }
    }

    pub fn with_version(mut self, version: IpVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.ip_address = Some(address);
        self
    }
}

/// How an address came to be attached to the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationSource {
    /// A new row was created.
    Minted,
    /// A deallocated row was reactivated.
    Reused,
    /// The address was already active on another port.
    Shared,
}

/// An IP address attached to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedIp {
    pub address: IpAddr,
    pub entry: IpAddressEntry,
    pub source: AllocationSource,
}

impl AllocatedIp {
    fn new(entry: IpAddressEntry, source: AllocationSource) -> AllocResult<Self> {
        Ok(Self {
            address: entry_ip(&entry)?,
            entry,
            source,
        })
    }
}

fn entry_ip(entry: &IpAddressEntry) -> AllocResult<IpAddr> {
    entry.ip().ok_or_else(|| {
        AllocError::Store(netalloc_store::StoreError::codec(
            IpAddressEntry::TABLE,
            format!("address {} does not fit IPv{}", entry.address, entry.version),
        ))
    })
}

/// Allocates and releases IP addresses inside one transaction.
#[derive(Debug, Clone, Copy)]
pub struct IpAllocator {
    reuse_after: Duration,
    strategy: IpamStrategy,
}

impl IpAllocator {
    pub fn new(reuse_after: Duration, strategy: IpamStrategy) -> Self {
        Self {
            reuse_after,
            strategy,
        }
    }

    pub fn strategy(&self) -> IpamStrategy {
        self.strategy
    }

    /// Attaches one or more addresses to the request's port.
    ///
    /// A requested version or explicit address always yields exactly one
    /// address; otherwise the strategy decides.
    pub fn allocate<T: Transaction>(
        &self,
        tx: &mut T,
        request: &AllocateIpRequest,
        now: DateTime<Utc>,
    ) -> AllocResult<Vec<AllocatedIp>> {
        let network = tx
            .get::<Network>(&request.network_id)?
            .ok_or_else(|| AllocError::network_not_found(&request.network_id))?;

        if let Some(address) = request.ip_address {
            return Ok(vec![self.allocate_explicit(tx, &network, request, address, now)?]);
        }

        let exhausted = || AllocError::ip_exhausted(&request.network_id);
        match (request.version, self.strategy) {
            (Some(version), _) => self
                .allocate_versions(tx, &network, request, &[version], now)?
                .map(|ip| vec![ip])
                .ok_or_else(exhausted),
            (None, IpamStrategy::Any) => self
                .allocate_versions(tx, &network, request, &[IpVersion::V4, IpVersion::V6], now)?
                .map(|ip| vec![ip])
                .ok_or_else(exhausted),
            (None, strategy) => {
                let mut allocated = Vec::with_capacity(2);
                for version in [IpVersion::V4, IpVersion::V6] {
                    if let Some(ip) = self.allocate_versions(tx, &network, request, &[version], now)? {
                        allocated.push(ip);
                    }
                }
                let required = if strategy == IpamStrategy::BothRequired { 2 } else { 1 };
                if allocated.len() < required {
                    debug!(
                        network = %request.network_id,
                        %strategy,
                        got = allocated.len(),
                        "Strategy not satisfied"
                    );
                    return Err(exhausted());
                }
                Ok(allocated)
            }
        }
    }

    /// Reuse, then mint, restricted to `versions` (tried in order).
    fn allocate_versions<T: Transaction>(
        &self,
        tx: &mut T,
        network: &Network,
        request: &AllocateIpRequest,
        versions: &[IpVersion],
        now: DateTime<Utc>,
    ) -> AllocResult<Option<AllocatedIp>> {
        if let Some(ip) = self.reuse(tx, request, versions, now)? {
            return Ok(Some(ip));
        }
        for version in versions {
            if let Some((subnet, excluded)) = select_subnet(tx, network, *version)? {
                if let Some(ip) = self.mint(tx, &subnet.id, &excluded, request, now)? {
                    return Ok(Some(ip));
                }
            }
        }
        Ok(None)
    }

    /// Reactivates the lowest cooled-down address of the network.
    fn reuse<T: Transaction>(
        &self,
        tx: &mut T,
        request: &AllocateIpRequest,
        versions: &[IpVersion],
        now: DateTime<Utc>,
    ) -> AllocResult<Option<AllocatedIp>> {
        for _ in 0..MAX_STALE_RECLAIMS {
            let candidate = tx
                .find_indexed::<IpAddressEntry>(&IpAddressEntry::by_network(&request.network_id))?
                .into_iter()
                .filter(|entry| {
                    entry.deallocated
                        && versions.contains(&entry.version)
                        && cooled_down(entry.deallocated_at, now, self.reuse_after)
                })
                .min_by_key(|entry| entry.address);
            let Some(mut entry) = candidate else {
                return Ok(None);
            };

            let in_subnet = match (tx.get::<Subnet>(&entry.subnet_id)?, entry.ip()) {
                (Some(subnet), Some(ip)) => subnet.cidr.contains_addr(&ip),
                _ => false,
            };
            if !in_subnet {
                warn!(
                    id = %entry.id,
                    address = %entry.address,
                    subnet = %entry.subnet_id,
                    "Deleting deallocated address outside its subnet"
                );
                delete_entry(tx, &entry.id)?;
                continue;
            }

            entry.deallocated = false;
            entry.deallocated_at = None;
            entry.allocated_at = now;
            tx.update(&entry)?;
            attach(tx, &request.port_id, &entry.id)?;

            let ip = AllocatedIp::new(entry, AllocationSource::Reused)?;
            debug!(address = %ip.address, port = %request.port_id, "Reusing deallocated IP address");
            return Ok(Some(ip));
        }
        Ok(None)
    }

    /// Takes the next free, non-excluded address of a subnet.
    fn mint<T: Transaction>(
        &self,
        tx: &mut T,
        subnet_id: &str,
        excluded: &ExcludedRanges,
        request: &AllocateIpRequest,
        now: DateTime<Utc>,
    ) -> AllocResult<Option<AllocatedIp>> {
        let mut subnet = tx.lock::<Subnet>(subnet_id)?;
        let (first, last) = (subnet.cidr.first(), subnet.cidr.last());
        let start = if (first..=last).contains(&subnet.next_auto_assign_ip) {
            subnet.next_auto_assign_ip
        } else {
            first
        };

        let mut candidate = start;
        let mut wrapped = false;
        let chosen = loop {
            if wrapped && candidate >= start {
                break None;
            }
            let skip_to = match excluded.covering(candidate) {
                Some(end) => end,
                None if is_taken(tx, &subnet.network_id, candidate)? => candidate,
                None => break Some(candidate),
            };
            match skip_to.checked_add(1).filter(|next| *next <= last) {
                Some(next) => candidate = next,
                None if !wrapped => {
                    wrapped = true;
                    candidate = first;
                }
                None => break None,
            }
        };
        let Some(address) = chosen else {
            debug!(subnet = %subnet.cidr, "No free address found while minting");
            return Ok(None);
        };

        subnet.next_auto_assign_ip = match address.checked_add(1) {
            Some(next) if next <= last => next,
            _ => first,
        };
        tx.update(&subnet)?;

        let entry = IpAddressEntry::new(&subnet, address, now);
        tx.create(&entry)?;
        attach(tx, &request.port_id, &entry.id)?;

        let ip = AllocatedIp::new(entry, AllocationSource::Minted)?;
        info!(address = %ip.address, subnet = %subnet.cidr, port = %request.port_id, "Minted IP address");
        Ok(Some(ip))
    }

    fn allocate_explicit<T: Transaction>(
        &self,
        tx: &mut T,
        network: &Network,
        request: &AllocateIpRequest,
        address: IpAddr,
        now: DateTime<Utc>,
    ) -> AllocResult<AllocatedIp> {
        let not_in_subnet = || AllocError::IpAddressNotInSubnet {
            network_id: network.id.clone(),
            address,
        };
        if request.version.is_some_and(|v| v != IpVersion::of(&address)) {
            return Err(not_in_subnet());
        }

        let subnet = tx
            .find_indexed::<Subnet>(&Subnet::by_network(&network.id))?
            .into_iter()
            .find(|subnet| subnet.cidr.contains_addr(&address))
            .ok_or_else(not_in_subnet)?;

        let value = addr_to_u128(&address);
        let existing =
            tx.get_unique::<IpAddressEntry>(&IpAddressEntry::unique_key_for(&network.id, value))?;

        match existing {
            Some(entry) if !entry.deallocated => {
                // a concurrent release of the last holder must conflict with us
                let entry = tx.lock::<IpAddressEntry>(&entry.id)?;
                attach(tx, &request.port_id, &entry.id)?;
                debug!(%address, port = %request.port_id, "Sharing active IP address");
                AllocatedIp::new(entry, AllocationSource::Shared)
            }
            Some(mut entry) => {
                entry.deallocated = false;
                entry.deallocated_at = None;
                entry.allocated_at = now;
                tx.update(&entry)?;
                attach(tx, &request.port_id, &entry.id)?;
                info!(%address, port = %request.port_id, "Reactivated requested IP address");
                AllocatedIp::new(entry, AllocationSource::Reused)
            }
            None => {
                // serialize with minting on the same subnet
                tx.lock::<Subnet>(&subnet.id)?;
                let entry = IpAddressEntry::new(&subnet, value, now);
                tx.create(&entry)?;
                attach(tx, &request.port_id, &entry.id)?;
                info!(%address, port = %request.port_id, "Allocated requested IP address");
                AllocatedIp::new(entry, AllocationSource::Minted)
            }
        }
    }

    /// Releases every address of a port.
    ///
    /// Addresses held only by this port are deallocated; shared ones just
    /// lose the association. Returns the addresses that were deallocated.
    pub fn deallocate<T: Transaction>(
        &self,
        tx: &mut T,
        port_id: &str,
        now: DateTime<Utc>,
    ) -> AllocResult<Vec<IpAddressEntry>> {
        let mut released = Vec::new();
        for assoc in tx.find_indexed::<PortIpAddress>(&PortIpAddress::by_port(port_id))? {
            if let Some(entry) = self.disassociate(tx, port_id, &assoc.ip_address_id, now)? {
                released.push(entry);
            }
        }
        Ok(released)
    }

    /// Drops one port/address association, deallocating the address if no
    /// port holds it any more. Returns the deallocated address, if any.
    pub fn disassociate<T: Transaction>(
        &self,
        tx: &mut T,
        port_id: &str,
        ip_address_id: &str,
        now: DateTime<Utc>,
    ) -> AllocResult<Option<IpAddressEntry>> {
        let key = PortIpAddress::key_for(port_id, ip_address_id);
        if tx.get::<PortIpAddress>(&key)?.is_none() {
            return Ok(None);
        }
        // holders of one address release it one transaction at a time
        lock_entry(tx, ip_address_id)?;
        tx.delete::<PortIpAddress>(&key)?;

        let remaining = tx
            .find_indexed::<PortIpAddress>(&PortIpAddress::by_ip(ip_address_id))?
            .len();
        if remaining > 0 {
            debug!(ip = ip_address_id, port = port_id, remaining, "Address still shared");
            return Ok(None);
        }
        self.release(tx, ip_address_id, now)
    }

    /// Replaces the set of ports holding an address.
    ///
    /// An empty set deallocates the address; a non-empty set reactivates a
    /// deallocated one.
    pub fn set_ports<T: Transaction>(
        &self,
        tx: &mut T,
        ip_address_id: &str,
        port_ids: &[String],
        now: DateTime<Utc>,
    ) -> AllocResult<IpAddressEntry> {
        let mut entry = lock_entry(tx, ip_address_id)?
            .ok_or_else(|| AllocError::IpAddressNotFound {
                id: ip_address_id.to_string(),
            })?;

        for assoc in tx.find_indexed::<PortIpAddress>(&PortIpAddress::by_ip(ip_address_id))? {
            if !port_ids.contains(&assoc.port_id) {
                tx.delete::<PortIpAddress>(&assoc.key())?;
            }
        }
        for port_id in port_ids {
            attach(tx, port_id, ip_address_id)?;
        }

        if port_ids.is_empty() {
            if let Some(released) = self.release(tx, ip_address_id, now)? {
                entry = released;
            }
        } else if entry.deallocated {
            entry.deallocated = false;
            entry.deallocated_at = None;
            entry.allocated_at = now;
            tx.update(&entry)?;
        }
        Ok(entry)
    }

    /// Addresses currently associated with a port.
    pub fn port_addresses<T: Transaction>(
        &self,
        tx: &mut T,
        port_id: &str,
    ) -> AllocResult<Vec<IpAddressEntry>> {
        let mut entries = Vec::new();
        for assoc in tx.find_indexed::<PortIpAddress>(&PortIpAddress::by_port(port_id))? {
            if let Some(entry) = tx.get::<IpAddressEntry>(&assoc.ip_address_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Ports currently associated with an address.
    pub fn address_ports<T: Transaction>(
        &self,
        tx: &mut T,
        ip_address_id: &str,
    ) -> AllocResult<Vec<String>> {
        Ok(tx
            .find_indexed::<PortIpAddress>(&PortIpAddress::by_ip(ip_address_id))?
            .into_iter()
            .map(|assoc| assoc.port_id)
            .collect())
    }

    fn release<T: Transaction>(
        &self,
        tx: &mut T,
        ip_address_id: &str,
        now: DateTime<Utc>,
    ) -> AllocResult<Option<IpAddressEntry>> {
        let Some(mut entry) = tx.get::<IpAddressEntry>(ip_address_id)? else {
            return Ok(None);
        };
        if entry.deallocated {
            return Ok(None);
        }
        entry.deallocated = true;
        entry.deallocated_at = Some(now);
        tx.update(&entry)?;
        info!(id = %entry.id, address = %entry_ip(&entry)?, "Deallocated IP address");
        Ok(Some(entry))
    }
}

/// First subnet of the network, in creation order, with room for one more
/// address. Returns the subnet with its resolved exclusions.
///
/// Rows inside an excluded range (explicit requests may land there) are
/// already counted by the exclusions.
fn select_subnet<T: Transaction>(
    tx: &mut T,
    network: &Network,
    version: IpVersion,
) -> AllocResult<Option<(Subnet, ExcludedRanges)>> {
    let mut subnets: Vec<Subnet> = tx
        .find_indexed::<Subnet>(&Subnet::by_network(&network.id))?
        .into_iter()
        .filter(|subnet| subnet.ip_version == version)
        .collect();
    subnets.sort_by_key(|subnet| subnet.created_at);

    for subnet in subnets {
        let excluded = ExcludedRanges::resolve(&subnet.cidr, &effective_policy(&subnet, Some(network)));
        let rows = tx
            .find_indexed::<IpAddressEntry>(&IpAddressEntry::by_subnet(&subnet.id))?
            .iter()
            .filter(|entry| !excluded.contains(entry.address))
            .count() as u128;
        if subnet.cidr.size() > rows.saturating_add(excluded.size()) {
            return Ok(Some((subnet, excluded)));
        }
        debug!(subnet = %subnet.cidr, rows, "Subnet full, skipping");
    }
    Ok(None)
}

fn is_taken<T: Transaction>(tx: &mut T, network_id: &str, address: u128) -> AllocResult<bool> {
    Ok(tx
        .get_unique::<IpAddressEntry>(&IpAddressEntry::unique_key_for(network_id, address))?
        .is_some())
}

/// Reads an address row and claims it, so any concurrent writer of the row
/// fails at commit.
fn lock_entry<T: Transaction>(tx: &mut T, ip_address_id: &str) -> AllocResult<Option<IpAddressEntry>> {
    if tx.get::<IpAddressEntry>(ip_address_id)?.is_none() {
        return Ok(None);
    }
    Ok(Some(tx.lock::<IpAddressEntry>(ip_address_id)?))
}

fn attach<T: Transaction>(tx: &mut T, port_id: &str, ip_address_id: &str) -> AllocResult<()> {
    let assoc = PortIpAddress::new(port_id, ip_address_id);
    if tx.get::<PortIpAddress>(&assoc.key())?.is_none() {
        tx.create(&assoc)?;
    }
    Ok(())
}

/// Removes an address row together with its associations.
pub(crate) fn delete_entry<T: Transaction>(tx: &mut T, ip_address_id: &str) -> AllocResult<()> {
    for assoc in tx.find_indexed::<PortIpAddress>(&PortIpAddress::by_ip(ip_address_id))? {
        tx.delete::<PortIpAddress>(&assoc.key())?;
    }
    tx.delete::<IpAddressEntry>(ip_address_id)?;
    Ok(())
}
