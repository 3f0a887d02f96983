//! MAC address allocation.
//!
//! Allocation prefers reusing a cooled-down address (lowest first) over
//! minting a new one, which bounds address-space growth. Minting walks each
//! eligible range from its cursor, wrapping once.

use crate::clock::cooled_down;
use crate::error::{AllocError, AllocResult};
use chrono::{DateTime, Utc};
use netalloc_store::records::{MacAddressEntry, MacAddressRange};
use netalloc_store::{Record, Scope, StoreError, Transaction};
use netalloc_types::{parse_mac_range, MacAddress};
use std::time::Duration;
use tracing::{debug, info};

/// A MAC address handed to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAllocation {
    pub address: MacAddress,
    pub mac_range_id: String,
    /// True when a previously deallocated address was reactivated.
    pub reused: bool,
}

impl MacAllocation {
    fn from_entry(entry: &MacAddressEntry, reused: bool) -> AllocResult<Self> {
        Ok(Self {
            address: to_mac(entry.address)?,
            mac_range_id: entry.mac_range_id.clone(),
            reused,
        })
    }
}

fn to_mac(address: u64) -> AllocResult<MacAddress> {
    MacAddress::from_u64(address).ok_or_else(|| {
        AllocError::Store(StoreError::codec(
            MacAddressEntry::TABLE,
            format!("address {:#x} exceeds 48 bits", address),
        ))
    })
}

/// Allocates and releases MAC addresses inside one transaction.
#[derive(Debug, Clone, Copy)]
pub struct MacAllocator {
    reuse_after: Duration,
}

impl MacAllocator {
    pub fn new(reuse_after: Duration) -> Self {
        Self { reuse_after }
    }

    /// Hands out a MAC address, or the requested one when given.
    pub fn allocate<T: Transaction>(
        &self,
        tx: &mut T,
        requested: Option<MacAddress>,
        now: DateTime<Utc>,
    ) -> AllocResult<MacAllocation> {
        if let Some(mac) = requested {
            return self.allocate_explicit(tx, mac);
        }

        if let Some(allocation) = self.reuse(tx, now)? {
            return Ok(allocation);
        }

        for range in self.list_ranges(tx)? {
            let in_use = tx
                .find_indexed::<MacAddressEntry>(&MacAddressEntry::by_range(&range.id))?
                .len() as u64;
            if in_use >= range.capacity() {
                debug!(range = %range.cidr, in_use, "MAC range full, skipping");
                continue;
            }
            if let Some(allocation) = self.mint(tx, &range.id)? {
                return Ok(allocation);
            }
        }

        Err(AllocError::MacAddressRangeExhausted)
    }

    /// Reactivates the lowest deallocated address whose cooldown has elapsed.
    fn reuse<T: Transaction>(
        &self,
        tx: &mut T,
        now: DateTime<Utc>,
    ) -> AllocResult<Option<MacAllocation>> {
        let reuse_after = self.reuse_after;
        let candidates = tx.find::<MacAddressEntry>(
            &|entry| entry.deallocated && cooled_down(entry.deallocated_at, now, reuse_after),
            Scope::All,
        )?;

        let Some(mut entry) = candidates.into_iter().min_by_key(|entry| entry.address) else {
            return Ok(None);
        };
        entry.deallocated = false;
        entry.deallocated_at = None;
        tx.update(&entry)?;

        let allocation = MacAllocation::from_entry(&entry, true)?;
        debug!(address = %allocation.address, "Reusing deallocated MAC address");
        Ok(Some(allocation))
    }

    /// Takes the next unused address of a range, starting at its cursor.
    fn mint<T: Transaction>(
        &self,
        tx: &mut T,
        range_id: &str,
    ) -> AllocResult<Option<MacAllocation>> {
        let mut range = tx.lock::<MacAddressRange>(range_id)?;
        let (first, last) = (range.first_address, range.last_address);

        let start = if range.contains(range.next_auto_assign_mac) {
            range.next_auto_assign_mac
        } else {
            first
        };

        // [start, last) then [first, start)
        let mut chosen = None;
        for candidate in (start..last).chain(first..start) {
            if tx
                .get::<MacAddressEntry>(&MacAddressEntry::key_for(candidate))?
                .is_none()
            {
                chosen = Some(candidate);
                break;
            }
        }
        let Some(address) = chosen else {
            return Ok(None);
        };

        range.next_auto_assign_mac = if address + 1 >= last { first } else { address + 1 };
        tx.update(&range)?;

        let entry = MacAddressEntry::new(address, range.id.clone());
        tx.create(&entry)?;

        let allocation = MacAllocation::from_entry(&entry, false)?;
        info!(address = %allocation.address, range = %range.cidr, "Minted MAC address");
        Ok(Some(allocation))
    }

    fn allocate_explicit<T: Transaction>(
        &self,
        tx: &mut T,
        mac: MacAddress,
    ) -> AllocResult<MacAllocation> {
        let address = mac.to_u64();
        if let Some(mut entry) = tx.get::<MacAddressEntry>(&MacAddressEntry::key_for(address))? {
            if !entry.deallocated {
                return Err(AllocError::MacAddressInUse {
                    address: mac.to_string(),
                });
            }
            entry.deallocated = false;
            entry.deallocated_at = None;
            tx.update(&entry)?;
            return MacAllocation::from_entry(&entry, true);
        }

        let range = self
            .list_ranges(tx)?
            .into_iter()
            .find(|range| range.contains(address))
            .ok_or_else(|| AllocError::MacAddressNotInRange {
                address: mac.to_string(),
            })?;

        // serialize with minting on the same range
        tx.lock::<MacAddressRange>(&range.id)?;
        let entry = MacAddressEntry::new(address, range.id.clone());
        tx.create(&entry)?;
        info!(address = %mac, range = %range.cidr, "Allocated requested MAC address");
        MacAllocation::from_entry(&entry, false)
    }

    /// Marks an address deallocated and stamps the time.
    ///
    /// Returns `None` when the address was already deallocated.
    pub fn deallocate<T: Transaction>(
        &self,
        tx: &mut T,
        mac: MacAddress,
        now: DateTime<Utc>,
    ) -> AllocResult<Option<MacAddressEntry>> {
        let mut entry = tx
            .get::<MacAddressEntry>(&MacAddressEntry::key_for(mac.to_u64()))?
            .ok_or_else(|| AllocError::MacAddressNotFound {
                address: mac.to_string(),
            })?;

        if entry.deallocated {
            debug!(address = %mac, "MAC address already deallocated");
            return Ok(None);
        }
        entry.deallocated = true;
        entry.deallocated_at = Some(now);
        tx.update(&entry)?;
        info!(address = %mac, "Deallocated MAC address");
        Ok(Some(entry))
    }

    /// Defines a new range from MAC prefix text.
    ///
    /// Overlap with existing ranges is not checked.
    pub fn create_range<T: Transaction>(
        &self,
        tx: &mut T,
        text: &str,
        now: DateTime<Utc>,
    ) -> AllocResult<MacAddressRange> {
        let parsed = parse_mac_range(text)?;
        let range = MacAddressRange::new(
            parsed.cidr,
            parsed.first_address,
            parsed.last_address,
            now,
        );
        tx.create(&range)?;
        info!(range = %range.cidr, id = %range.id, "Created MAC address range");
        Ok(range)
    }

    /// Removes a range; refused while any of its addresses is active.
    pub fn delete_range<T: Transaction>(&self, tx: &mut T, id: &str) -> AllocResult<()> {
        if tx.get::<MacAddressRange>(id)?.is_none() {
            return Err(AllocError::MacAddressRangeNotFound { id: id.to_string() });
        }
        let entries = tx.find_indexed::<MacAddressEntry>(&MacAddressEntry::by_range(id))?;
        if entries.iter().any(|entry| !entry.deallocated) {
            return Err(AllocError::MacAddressRangeInUse { id: id.to_string() });
        }
        for entry in &entries {
            tx.delete::<MacAddressEntry>(&entry.key())?;
        }
        tx.delete::<MacAddressRange>(id)?;
        info!(id, "Deleted MAC address range");
        Ok(())
    }

    /// All ranges in insertion order.
    pub fn list_ranges<T: Transaction>(&self, tx: &mut T) -> AllocResult<Vec<MacAddressRange>> {
        Ok(tx.find::<MacAddressRange>(&|_| true, Scope::All)?)
    }
}
