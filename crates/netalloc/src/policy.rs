//! IP policy resolution.
//!
//! A policy lists subnet-relative exclusions that automatic assignment must
//! skip. The subnet's own policy wins over its network's; without either,
//! the family default applies.

use netalloc_store::records::{IpPolicy, Network, Subnet};
use netalloc_types::{IpPrefix, IpVersion};

/// The policy applied when neither the subnet nor its network has one.
///
/// IPv4 keeps the network address, the first host (default gateway) and the
/// broadcast address out of the pool; IPv6 keeps the subnet-router anycast
/// address and the first host.
pub fn default_policy(version: IpVersion) -> IpPolicy {
    match version {
        IpVersion::V4 => IpPolicy::new([(0, 2), (-1, 1)]),
        IpVersion::V6 => IpPolicy::new([(0, 2)]),
    }
}

/// Picks the policy that governs a subnet.
pub fn effective_policy(subnet: &Subnet, network: Option<&Network>) -> IpPolicy {
    subnet
        .ip_policy
        .clone()
        .or_else(|| network.and_then(|n| n.ip_policy.clone()))
        .unwrap_or_else(|| default_policy(subnet.ip_version))
}

/// Absolute, merged, inclusive address intervals excluded from a subnet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedRanges {
    intervals: Vec<(u128, u128)>,
}

impl ExcludedRanges {
    /// Resolves a policy against a subnet, clipping every exclusion to it.
    pub fn resolve(cidr: &IpPrefix, policy: &IpPolicy) -> Self {
        let first = cidr.first();
        let size = cidr.size();

        let mut intervals: Vec<(u128, u128)> = policy
            .exclusions
            .iter()
            .filter_map(|exclusion| {
                let (start, length) = if exclusion.offset >= 0 {
                    (exclusion.offset.unsigned_abs(), exclusion.length)
                } else {
                    let back = exclusion.offset.unsigned_abs();
                    match size.checked_sub(back) {
                        Some(start) => (start, exclusion.length),
                        // starts before the subnet; keep only the overlap
                        None => (0, exclusion.length.saturating_sub(back - size)),
                    }
                };
                if length == 0 || start >= size {
                    return None;
                }
                let end = start.saturating_add(length - 1).min(size - 1);
                Some((first + start, first + end))
            })
            .collect();

        intervals.sort_unstable();
        let mut merged: Vec<(u128, u128)> = Vec::with_capacity(intervals.len());
        for (start, end) in intervals {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Self { intervals: merged }
    }

    /// Number of excluded addresses.
    pub fn size(&self) -> u128 {
        self.intervals
            .iter()
            .fold(0u128, |acc, (start, end)| acc.saturating_add(end - start + 1))
    }

    pub fn contains(&self, address: u128) -> bool {
        self.covering(address).is_some()
    }

    /// Last address of the interval containing `address`, if any.
    pub fn covering(&self, address: u128) -> Option<u128> {
        self.intervals
            .iter()
            .find(|(start, end)| *start <= address && address <= *end)
            .map(|(_, end)| *end)
    }
}
