//! Entry point for the CRUD glue.
//!
//! Each operation runs in its own transaction, re-run from scratch when its
//! commit loses a race. Address events are published only once the
//! transaction that produced them has committed.

use crate::clock::{Clock, SystemClock};
use crate::config::AllocatorConfig;
use crate::error::{AllocError, AllocResult};
use crate::ip::{AllocateIpRequest, AllocatedIp, AllocationSource, IpAllocator};
use crate::mac::{MacAllocation, MacAllocator};
use crate::notify::{AddressEvent, EventKind, EventSink, TracingEventSink};
use crate::routes::{
    self, CreateRouteRequest, CreateSubnetRequest, SubnetDetails, UpdateSubnetRequest,
};
use chrono::{DateTime, Utc};
use netalloc_store::records::{IpAddressEntry, IpPolicy, MacAddressEntry, MacAddressRange, Network, Route};
use netalloc_store::{Datastore, RetryPolicy, Transaction};
use netalloc_types::{IpVersion, MacAddress};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// What a port asks for when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortAllocationRequest {
    pub version: Option<IpVersion>,
    pub ip_address: Option<IpAddr>,
    pub mac_address: Option<MacAddress>,
}

/// Everything assigned to a new port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub port_id: String,
    pub addresses: Vec<AllocatedIp>,
    pub mac: MacAllocation,
}

/// Allocation operations over a shared datastore.
pub struct AllocationFacade<S: Datastore> {
    store: Arc<S>,
    config: AllocatorConfig,
    mac: MacAllocator,
    ip: IpAllocator,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl<S: Datastore + 'static> AllocationFacade<S> {
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Self {
        let reuse_after = config.reuse_after();
        Self {
            store,
            mac: MacAllocator::new(reuse_after),
            ip: IpAllocator::new(reuse_after, config.ipam_strategy),
            retry: RetryPolicy::new(config.max_conflict_retries),
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs `body` in a fresh transaction per attempt and commits it.
    fn transact<T, F>(&self, operation: &str, mut body: F) -> AllocResult<T>
    where
        F: FnMut(&mut S::Tx<'_>, DateTime<Utc>) -> AllocResult<T>,
    {
        self.retry.run(operation, || {
            let mut tx = self.store.begin();
            let value = body(&mut tx, self.clock.now())?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn publish(&self, events: impl IntoIterator<Item = AddressEvent>) {
        for event in events {
            self.events.publish(&event);
        }
    }

    fn ip_event(&self, kind: EventKind, entry: &IpAddressEntry, port_id: Option<&str>) -> AddressEvent {
        let address = entry
            .ip()
            .map_or_else(|| entry.address.to_string(), |ip| ip.to_string());
        AddressEvent::new(kind, address, self.clock.now())
            .with_network(&entry.network_id)
            .with_ip_block(&entry.subnet_id)
            .with_ports(port_id.map(str::to_string))
    }

    fn mac_event(&self, kind: EventKind, address: MacAddress, range_id: &str) -> AddressEvent {
        AddressEvent::new(kind, address.to_string(), self.clock.now()).with_mac_range(range_id)
    }

    #[instrument(skip(self, ip_policy))]
    pub fn create_network(&self, name: &str, ip_policy: Option<IpPolicy>) -> AllocResult<Network> {
        self.transact("create_network", |tx, _| {
            let mut network = Network::new(name);
            network.ip_policy = ip_policy.clone();
            tx.create(&network)?;
            Ok(network)
        })
    }

    #[instrument(skip(self, request), fields(network = %request.network_id, cidr = %request.cidr))]
    pub fn create_subnet(&self, request: &CreateSubnetRequest) -> AllocResult<SubnetDetails> {
        self.transact("create_subnet", |tx, now| routes::create_subnet(tx, request, now))
    }

    #[instrument(skip(self, request))]
    pub fn update_subnet(&self, id: &str, request: &UpdateSubnetRequest) -> AllocResult<SubnetDetails> {
        self.transact("update_subnet", |tx, _| routes::update_subnet(tx, id, request))
    }

    #[instrument(skip(self))]
    pub fn delete_subnet(&self, id: &str) -> AllocResult<()> {
        self.transact("delete_subnet", |tx, _| routes::delete_subnet(tx, id))
    }

    pub fn subnet_details(&self, id: &str) -> AllocResult<SubnetDetails> {
        self.transact("subnet_details", |tx, _| routes::subnet_details(tx, id))
    }

    #[instrument(skip(self, request), fields(subnet = %request.subnet_id, destination = %request.route.destination))]
    pub fn create_route(&self, request: &CreateRouteRequest) -> AllocResult<Route> {
        self.transact("create_route", |tx, _| routes::create_route(tx, request))
    }

    #[instrument(skip(self))]
    pub fn delete_route(&self, id: &str) -> AllocResult<Route> {
        self.transact("delete_route", |tx, _| routes::delete_route(tx, id))
    }

    #[instrument(skip(self))]
    pub fn create_mac_address_range(&self, text: &str) -> AllocResult<MacAddressRange> {
        self.transact("create_mac_address_range", |tx, now| {
            self.mac.create_range(tx, text, now)
        })
    }

    #[instrument(skip(self))]
    pub fn delete_mac_address_range(&self, id: &str) -> AllocResult<()> {
        self.transact("delete_mac_address_range", |tx, _| self.mac.delete_range(tx, id))
    }

    pub fn list_mac_address_ranges(&self) -> AllocResult<Vec<MacAddressRange>> {
        self.transact("list_mac_address_ranges", |tx, _| self.mac.list_ranges(tx))
    }

    /// Attaches addresses to a port according to the configured strategy.
    #[instrument(skip(self, request), fields(network = %request.network_id, port = %request.port_id))]
    pub fn allocate_ip_address(&self, request: &AllocateIpRequest) -> AllocResult<Vec<AllocatedIp>> {
        let allocated = self.transact("allocate_ip_address", |tx, now| {
            self.ip.allocate(tx, request, now)
        })?;

        self.publish(
            allocated
                .iter()
                .filter(|ip| ip.source != AllocationSource::Shared)
                .map(|ip| self.ip_event(EventKind::IpAddressCreate, &ip.entry, Some(&request.port_id))),
        );
        Ok(allocated)
    }

    /// Releases every address held by a port; shared addresses stay active
    /// for their other ports.
    #[instrument(skip(self))]
    pub fn deallocate_ip_address(&self, port_id: &str) -> AllocResult<Vec<IpAddressEntry>> {
        let released = self.transact("deallocate_ip_address", |tx, now| {
            self.ip.deallocate(tx, port_id, now)
        })?;

        self.publish(
            released
                .iter()
                .map(|entry| self.ip_event(EventKind::IpAddressDelete, entry, Some(port_id))),
        );
        Ok(released)
    }

    /// Replaces the ports holding an address.
    #[instrument(skip(self, port_ids))]
    pub fn update_ip_address(&self, ip_address_id: &str, port_ids: &[String]) -> AllocResult<IpAddressEntry> {
        let (before, after) = self.transact("update_ip_address", |tx, now| {
            let before = tx.get::<IpAddressEntry>(ip_address_id)?;
            let after = self.ip.set_ports(tx, ip_address_id, port_ids, now)?;
            Ok((before, after))
        })?;

        let was_active = before.is_some_and(|entry| !entry.deallocated);
        if was_active && after.deallocated {
            self.publish([self.ip_event(EventKind::IpAddressDelete, &after, None)]);
        } else if !was_active && !after.deallocated {
            self.publish([self
                .ip_event(EventKind::IpAddressCreate, &after, None)
                .with_ports(port_ids.iter().cloned())]);
        }
        Ok(after)
    }

    #[instrument(skip(self))]
    pub fn allocate_mac_address(&self, requested: Option<MacAddress>) -> AllocResult<MacAllocation> {
        let allocation = self.transact("allocate_mac_address", |tx, now| {
            self.mac.allocate(tx, requested, now)
        })?;

        self.publish([self.mac_event(
            EventKind::MacAddressCreate,
            allocation.address,
            &allocation.mac_range_id,
        )]);
        Ok(allocation)
    }

    /// Returns `None` when the address was already deallocated.
    #[instrument(skip(self))]
    pub fn deallocate_mac_address(&self, mac: MacAddress) -> AllocResult<Option<MacAddressEntry>> {
        let released = self.transact("deallocate_mac_address", |tx, now| {
            self.mac.deallocate(tx, mac, now)
        })?;

        if let Some(entry) = &released {
            self.publish([self.mac_event(EventKind::MacAddressDelete, mac, &entry.mac_range_id)]);
        }
        Ok(released)
    }

    /// Assigns IP addresses, then a MAC address, to a new port.
    ///
    /// If the MAC cannot be allocated, the port's addresses are released
    /// again before the MAC error is returned.
    #[instrument(skip(self, request))]
    pub fn allocate_port(
        &self,
        network_id: &str,
        port_id: &str,
        request: &PortAllocationRequest,
    ) -> AllocResult<PortAllocation> {
        let ip_request = AllocateIpRequest {
            network_id: network_id.to_string(),
            port_id: port_id.to_string(),
            version: request.version,
            ip_address: request.ip_address,
        };
        let addresses = self.allocate_ip_address(&ip_request)?;

        let mac = match self.allocate_mac_address(request.mac_address) {
            Ok(mac) => mac,
            Err(mac_error) => {
                warn!(port = port_id, error = %mac_error, "MAC allocation failed, releasing port addresses");
                if let Err(rollback_error) = self.deallocate_ip_address(port_id) {
                    error!(
                        port = port_id,
                        error = %rollback_error,
                        "Failed to release addresses after MAC allocation failure"
                    );
                }
                return Err(mac_error);
            }
        };

        info!(
            port = port_id,
            mac = %mac.address,
            addresses = ?addresses.iter().map(|ip| ip.address).collect::<Vec<_>>(),
            "Allocated port"
        );
        Ok(PortAllocation {
            port_id: port_id.to_string(),
            addresses,
            mac,
        })
    }

    /// Releases a port's MAC and IP addresses.
    ///
    /// Both releases always run; every failure is reported together.
    #[instrument(skip(self))]
    pub fn release_port(&self, port_id: &str, mac: Option<MacAddress>) -> AllocResult<()> {
        let mut errors = Vec::new();

        if let Some(mac) = mac {
            if let Err(e) = self.deallocate_mac_address(mac) {
                warn!(port = port_id, error = %e, "Failed to release MAC address");
                errors.push(e);
            }
        }
        if let Err(e) = self.deallocate_ip_address(port_id) {
            warn!(port = port_id, error = %e, "Failed to release IP addresses");
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AllocError::Release { errors })
        }
    }

    /// Addresses currently attached to a port.
    pub fn port_addresses(&self, port_id: &str) -> AllocResult<Vec<IpAddressEntry>> {
        self.transact("port_addresses", |tx, _| self.ip.port_addresses(tx, port_id))
    }
}
