//! Address and route allocation engine.
//!
//! Hands out globally unique IPv4/IPv6 addresses and 48-bit MAC addresses to
//! virtual network ports, and keeps the routing metadata of IP subnets:
//!
//! - [`mac`]: MAC ranges and MAC allocation with a reuse cooldown
//! - [`ip`]: IP allocation from subnet pools, explicit addresses, strategies
//! - [`routes`]: default-route synthesis and overlapping-route detection
//! - [`facade`]: transactional, retrying entry points for the CRUD glue
//! - [`notify`]: address events published after each commit
//!
//! # Example
//!
//! ```
//! use netalloc::{AllocationFacade, AllocatorConfig, CreateSubnetRequest, PortAllocationRequest};
//! use netalloc_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let facade = AllocationFacade::new(Arc::new(MemoryStore::new()), AllocatorConfig::default());
//! let network = facade.create_network("public", None).unwrap();
//! facade
//!     .create_subnet(&CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse().unwrap()))
//!     .unwrap();
//! facade.create_mac_address_range("AA:BB:CC").unwrap();
//!
//! let port = facade
//!     .allocate_port(&network.id, "port-1", &PortAllocationRequest::default())
//!     .unwrap();
//! assert_eq!(port.addresses[0].address.to_string(), "10.0.0.2");
//! assert_eq!(port.mac.address.to_string(), "aa:bb:cc:00:00:00");
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod facade;
pub mod ip;
pub mod logging;
pub mod mac;
pub mod notify;
pub mod policy;
pub mod routes;

pub use backend::{BackendError, BackendPort, NetworkBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AllocatorConfig;
pub use error::{AllocError, AllocResult};
pub use facade::{AllocationFacade, PortAllocation, PortAllocationRequest};
pub use ip::{AllocateIpRequest, AllocatedIp, AllocationSource, IpAllocator, IpamStrategy};
pub use mac::{MacAllocation, MacAllocator};
pub use notify::{AddressEvent, EventKind, EventSink, MemoryEventSink, TracingEventSink};
pub use routes::{
    overlaps, synthesize_default_route, CreateRouteRequest, CreateSubnetRequest, RoutePlan,
    RouteSpec, SubnetDetails, UpdateSubnetRequest,
};

pub use netalloc_types::{parse_mac_range, IpPrefix, IpVersion, MacAddress, MacRange};
