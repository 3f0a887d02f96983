//! Address lifecycle events.
//!
//! Every committed IP or MAC creation and release produces one
//! [`AddressEvent`], published through an [`EventSink`]. The default sink
//! writes structured records to the `netalloc::events` tracing target.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// What happened to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ip_block.address.create")]
    IpAddressCreate,
    #[serde(rename = "ip_block.address.delete")]
    IpAddressDelete,
    #[serde(rename = "mac_address.create")]
    MacAddressCreate,
    #[serde(rename = "mac_address.delete")]
    MacAddressDelete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::IpAddressCreate => write!(f, "ip_block.address.create"),
            EventKind::IpAddressDelete => write!(f, "ip_block.address.delete"),
            EventKind::MacAddressCreate => write!(f, "mac_address.create"),
            EventKind::MacAddressDelete => write!(f, "mac_address.delete"),
        }
    }
}

/// A structured record of one address changing hands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Address in text form (dotted/colon IP or colon-separated MAC).
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// The subnet (IP block) the address belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_block_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_range_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_ids: Vec<String>,
}

impl AddressEvent {
    pub fn new(kind: EventKind, address: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            address: address.into(),
            network_id: None,
            ip_block_id: None,
            mac_range_id: None,
            port_ids: Vec::new(),
        }
    }

    pub fn with_network(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }

    pub fn with_ip_block(mut self, subnet_id: impl Into<String>) -> Self {
        self.ip_block_id = Some(subnet_id.into());
        self
    }

    pub fn with_mac_range(mut self, range_id: impl Into<String>) -> Self {
        self.mac_range_id = Some(range_id.into());
        self
    }

    pub fn with_ports(mut self, port_ids: impl IntoIterator<Item = String>) -> Self {
        self.port_ids = port_ids.into_iter().collect();
        self
    }

    /// Convert to JSON string for logging
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Receives address events after their transaction commits.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &AddressEvent);
}

/// Logs events at info level on the `netalloc::events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &AddressEvent) {
        info!(
            target: "netalloc::events",
            event = %event.kind,
            address = %event.address,
            event_json = %event.to_json(),
            "EVENT: {} - {}",
            event.kind,
            event.address
        );
    }
}

/// Keeps events in memory, for tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AddressEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events published so far.
    pub fn events(&self) -> Vec<AddressEvent> {
        self.events.lock().clone()
    }

    /// Removes and returns the events published so far.
    pub fn take(&self) -> Vec<AddressEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: &AddressEvent) {
        self.events.lock().push(event.clone());
    }
}
