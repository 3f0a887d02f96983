//! End-to-end allocation scenarios through the facade.

use anyhow::Result;
use chrono::Utc;
use netalloc::{
    AllocError, AllocateIpRequest, AllocationFacade, AllocatorConfig, CreateRouteRequest,
    CreateSubnetRequest, EventKind, IpamStrategy, ManualClock, MemoryEventSink,
    PortAllocationRequest, RouteSpec,
};
use netalloc_store::records::{IpPolicy, Network};
use netalloc_store::MemoryStore;
use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| netalloc::logging::init_logging_pretty("warn"));
}

struct Env {
    facade: AllocationFacade<MemoryStore>,
    clock: Arc<ManualClock>,
    events: Arc<MemoryEventSink>,
}

fn env(config: AllocatorConfig) -> Env {
    init_tracing();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = Arc::new(MemoryEventSink::new());
    let facade = AllocationFacade::new(Arc::new(MemoryStore::new()), config)
        .with_clock(clock.clone())
        .with_event_sink(events.clone());
    Env {
        facade,
        clock,
        events,
    }
}

impl Env {
    fn network_with(&self, cidrs: &[&str]) -> Result<Network> {
        let network = self.facade.create_network("tenant", None)?;
        for cidr in cidrs {
            self.facade
                .create_subnet(&CreateSubnetRequest::new(&network.id, cidr.parse()?))?;
            self.clock.advance(Duration::from_secs(1));
        }
        Ok(network)
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_mac_range_from_hyphen_prefix() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let range = env.facade.create_mac_address_range("AA-BB-CC")?;
    assert_eq!(range.cidr, "AA:BB:CC:00:00:00/24");
    assert_eq!(range.first_address, 0xAABBCC000000);
    assert_eq!(range.last_address, 0xAABBCD000000);

    let err = env.facade.create_mac_address_range("F0-0-BAR").unwrap_err();
    assert!(matches!(err, AllocError::InvalidRange(_)));
    assert_eq!(env.facade.list_mac_address_ranges()?.len(), 1);
    Ok(())
}

#[test]
fn test_default_route_synthesis_and_conflict() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.facade.create_network("tenant", None)?;
    let subnet = env
        .facade
        .create_subnet(&CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse()?))?;

    assert_eq!(subnet.gateway_ip, Some(ip("10.0.0.1")));
    assert_eq!(subnet.routes.len(), 1);
    assert!(subnet.routes[0].cidr.is_default());
    assert_eq!(subnet.routes[0].gateway, ip("10.0.0.1"));

    let request = CreateRouteRequest {
        subnet_id: subnet.subnet.id.clone(),
        route: RouteSpec::new("0.0.0.0/0".parse()?, ip("10.0.0.9")),
    };
    match env.facade.create_route(&request) {
        Err(AllocError::RouteConflict { route_id, cidr }) => {
            assert_eq!(route_id, subnet.routes[0].id);
            assert!(cidr.is_default());
        }
        other => panic!("expected route conflict, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_saturated_subnet_reports_exhaustion() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.network_with(&["10.0.0.0/30"])?;

    let first = env
        .facade
        .allocate_ip_address(&AllocateIpRequest::new(&network.id, "p1"))?;
    assert_eq!(first[0].address, ip("10.0.0.2"));

    let err = env
        .facade
        .allocate_ip_address(&AllocateIpRequest::new(&network.id, "p2"))
        .unwrap_err();
    assert_eq!(
        err,
        AllocError::IpAddressExhausted {
            network_id: network.id.clone()
        }
    );
    Ok(())
}

#[test]
fn test_explicit_address_shared_by_two_ports() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.network_with(&["10.0.0.0/24"])?;
    env.facade.create_mac_address_range("AA:BB:CC")?;

    let request = PortAllocationRequest {
        ip_address: Some(ip("10.0.0.50")),
        ..Default::default()
    };
    let a = env.facade.allocate_port(&network.id, "p1", &request)?;
    let b = env.facade.allocate_port(&network.id, "p2", &request)?;
    assert_eq!(a.addresses[0].entry.id, b.addresses[0].entry.id);
    assert_ne!(a.mac.address, b.mac.address);

    // only the first port created the address
    let created = env
        .events
        .kinds()
        .into_iter()
        .filter(|k| *k == EventKind::IpAddressCreate)
        .count();
    assert_eq!(created, 1);

    env.facade.release_port("p1", Some(a.mac.address))?;
    assert_eq!(env.facade.port_addresses("p2")?.len(), 1);
    assert!(!env.facade.port_addresses("p2")?[0].deallocated);

    let outside = PortAllocationRequest {
        ip_address: Some(ip("10.9.0.1")),
        ..Default::default()
    };
    assert!(matches!(
        env.facade.allocate_port(&network.id, "p3", &outside),
        Err(AllocError::IpAddressNotInSubnet { .. })
    ));
    Ok(())
}

#[test]
fn test_dual_stack_strategies() -> Result<()> {
    let both = env(AllocatorConfig {
        ipam_strategy: IpamStrategy::Both,
        ..Default::default()
    });
    let network = both.network_with(&["10.0.0.0/24", "2001:db8::/64"])?;
    let got = both
        .facade
        .allocate_ip_address(&AllocateIpRequest::new(&network.id, "p1"))?;
    let addresses: Vec<IpAddr> = got.iter().map(|a| a.address).collect();
    assert_eq!(addresses, vec![ip("10.0.0.2"), ip("2001:db8::2")]);

    let required = env(AllocatorConfig {
        ipam_strategy: IpamStrategy::BothRequired,
        ..Default::default()
    });
    let v4_only = required.network_with(&["10.0.0.0/24"])?;
    let err = required
        .facade
        .allocate_ip_address(&AllocateIpRequest::new(&v4_only.id, "p1"))
        .unwrap_err();
    assert!(matches!(err, AllocError::IpAddressExhausted { .. }));
    // the failed attempt left nothing behind
    assert!(required.events.events().is_empty());
    assert!(required.facade.port_addresses("p1")?.is_empty());
    Ok(())
}

#[test]
fn test_policy_precedence() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env
        .facade
        .create_network("tenant", Some(IpPolicy::new([(0, 10)])))?;

    let from_network = env
        .facade
        .create_subnet(&CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse()?))?;
    let got = env
        .facade
        .allocate_ip_address(&AllocateIpRequest::new(&network.id, "p1"))?;
    assert_eq!(got[0].address, ip("10.0.0.10"));
    env.facade.delete_subnet(&from_network.subnet.id).unwrap_err();

    // a /28 keeping only offsets 1..=5
    let other = env.facade.create_network("other", Some(IpPolicy::new([(0, 10)])))?;
    env.facade.create_subnet(
        &CreateSubnetRequest::new(&other.id, "192.168.0.0/28".parse()?)
            .with_policy(IpPolicy::new([(0, 1), (-10, 10)])),
    )?;
    let mut handed_out = Vec::new();
    for port in 0..5 {
        let got = env
            .facade
            .allocate_ip_address(&AllocateIpRequest::new(&other.id, format!("port-{}", port)))?;
        handed_out.push(got[0].address);
    }
    assert_eq!(
        handed_out,
        vec![
            ip("192.168.0.1"),
            ip("192.168.0.2"),
            ip("192.168.0.3"),
            ip("192.168.0.4"),
            ip("192.168.0.5"),
        ]
    );
    assert!(matches!(
        env.facade
            .allocate_ip_address(&AllocateIpRequest::new(&other.id, "port-5")),
        Err(AllocError::IpAddressExhausted { .. })
    ));
    Ok(())
}

#[test]
fn test_reuse_waits_for_cooldown() -> Result<()> {
    let env = env(AllocatorConfig {
        reuse_after_secs: 3600,
        ..Default::default()
    });
    let network = env.network_with(&["10.0.0.0/24"])?;
    env.facade.create_mac_address_range("02:00:00:00:00")?;
    let request = PortAllocationRequest::default();

    let first = env.facade.allocate_port(&network.id, "p1", &request)?;
    env.facade.release_port("p1", Some(first.mac.address))?;

    env.clock.advance(Duration::from_secs(3599));
    let early = env.facade.allocate_port(&network.id, "p2", &request)?;
    assert_ne!(early.mac.address, first.mac.address);

    env.clock.advance(Duration::from_secs(1));
    let late = env.facade.allocate_port(&network.id, "p3", &request)?;
    assert_eq!(late.mac.address, first.mac.address);
    assert_eq!(late.addresses[0].address, first.addresses[0].address);
    Ok(())
}

#[test]
fn test_mac_exhaustion_rolls_back_port_addresses() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.network_with(&["10.0.0.0/24"])?;
    // two addresses only
    env.facade.create_mac_address_range("02:00:00:00:00:00/47")?;
    let request = PortAllocationRequest::default();

    env.facade.allocate_port(&network.id, "p1", &request)?;
    env.facade.allocate_port(&network.id, "p2", &request)?;
    let err = env
        .facade
        .allocate_port(&network.id, "p3", &request)
        .unwrap_err();
    assert_eq!(err, AllocError::MacAddressRangeExhausted);

    let addresses = env.facade.port_addresses("p3")?;
    assert!(addresses.is_empty());
    assert_eq!(
        env.events.kinds().last().copied(),
        Some(EventKind::IpAddressDelete)
    );
    Ok(())
}

#[test]
fn test_release_reports_every_failure() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.network_with(&["10.0.0.0/24"])?;
    env.facade.create_mac_address_range("AA:BB:CC")?;
    let port = env
        .facade
        .allocate_port(&network.id, "p1", &PortAllocationRequest::default())?;

    let stranger = "02:00:00:00:00:01".parse()?;
    let err = env.facade.release_port("p1", Some(stranger)).unwrap_err();
    let AllocError::Release { errors } = err else {
        panic!("expected release error");
    };
    assert_eq!(errors.len(), 1);

    // the IP side ran despite the MAC failure
    assert!(env.facade.port_addresses("p1")?.is_empty());
    env.facade.deallocate_mac_address(port.mac.address)?;
    Ok(())
}

#[test]
fn test_subnet_update_replaces_routes_and_dns() -> Result<()> {
    let env = env(AllocatorConfig::default());
    let network = env.facade.create_network("tenant", None)?;
    let created = env.facade.create_subnet(
        &CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse()?)
            .with_dns(ip("1.1.1.1"))
            .with_dns(ip("8.8.8.8")),
    )?;

    let update = netalloc::UpdateSubnetRequest {
        host_routes: Some(vec![
            RouteSpec::new("192.168.0.0/24".parse()?, ip("10.0.0.3")),
            RouteSpec::new("172.16.0.0/12".parse()?, ip("10.0.0.4")),
        ]),
        dns_nameservers: Some(vec![ip("9.9.9.9")]),
        ..Default::default()
    };
    let updated = env.facade.update_subnet(&created.subnet.id, &update)?;
    assert_eq!(updated.gateway_ip, None);
    assert_eq!(updated.routes.len(), 2);
    assert_eq!(updated.dns_nameservers, vec![ip("9.9.9.9")]);
    assert_eq!(env.facade.subnet_details(&created.subnet.id)?, updated);
    Ok(())
}
