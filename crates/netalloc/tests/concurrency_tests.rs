//! Concurrent callers against one shared store.
//!
//! Each worker runs on the blocking pool so the optimistic commits really
//! race; the retry budget is large enough that no worker gives up.

use anyhow::Result;
use netalloc::{
    AllocError, AllocateIpRequest, AllocationFacade, AllocatorConfig, CreateRouteRequest,
    CreateSubnetRequest, RouteSpec,
};
use netalloc_store::MemoryStore;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Barrier};

const WORKERS: usize = 8;
const PER_WORKER: usize = 10;

fn facade() -> Arc<AllocationFacade<MemoryStore>> {
    let config = AllocatorConfig {
        max_conflict_retries: 1000,
        ..Default::default()
    };
    Arc::new(AllocationFacade::new(Arc::new(MemoryStore::new()), config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mac_allocation_is_unique() -> Result<()> {
    let facade = facade();
    facade.create_mac_address_range("AA:BB:CC")?;
    let barrier = Arc::new(Barrier::new(WORKERS));

    let mut handles = Vec::new();
    for _ in 0..WORKERS {
        let facade = facade.clone();
        let barrier = barrier.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            (0..PER_WORKER)
                .map(|_| facade.allocate_mac_address(None).map(|m| m.address))
                .collect::<Result<Vec<_>, AllocError>>()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for mac in handle.await?? {
            assert!(seen.insert(mac), "MAC {} handed out twice", mac);
        }
    }
    assert_eq!(seen.len(), WORKERS * PER_WORKER);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ip_allocation_is_unique() -> Result<()> {
    let facade = facade();
    let network = facade.create_network("tenant", None)?;
    facade.create_subnet(&CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse()?))?;
    let barrier = Arc::new(Barrier::new(WORKERS));

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let facade = facade.clone();
        let barrier = barrier.clone();
        let network_id = network.id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            let mut addresses: Vec<IpAddr> = Vec::new();
            for n in 0..PER_WORKER {
                let request = AllocateIpRequest::new(&network_id, format!("w{}-p{}", worker, n));
                addresses.extend(facade.allocate_ip_address(&request)?.iter().map(|a| a.address));
            }
            Ok::<_, AllocError>(addresses)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for address in handle.await?? {
            assert!(seen.insert(address), "{} handed out twice", address);
        }
    }
    assert_eq!(seen.len(), WORKERS * PER_WORKER);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_never_double_allocates() -> Result<()> {
    // zero cooldown: released addresses are immediately reusable
    let config = AllocatorConfig {
        reuse_after_secs: 0,
        max_conflict_retries: 1000,
        ..Default::default()
    };
    let facade = Arc::new(AllocationFacade::new(Arc::new(MemoryStore::new()), config));
    facade.create_mac_address_range("02:00:00:00:00")?;
    let barrier = Arc::new(Barrier::new(WORKERS));

    let mut handles = Vec::new();
    for _ in 0..WORKERS {
        let facade = facade.clone();
        let barrier = barrier.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            for _ in 0..PER_WORKER {
                let mac = facade.allocate_mac_address(None)?;
                facade.deallocate_mac_address(mac.address)?;
            }
            facade.allocate_mac_address(None).map(|m| m.address)
        }));
    }

    let mut held = HashSet::new();
    for handle in handles {
        let mac = handle.await??;
        assert!(held.insert(mac), "MAC {} active twice", mac);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_overlapping_routes_admit_one() -> Result<()> {
    let facade = facade();
    let network = facade.create_network("tenant", None)?;
    let subnet = facade.create_subnet(&CreateSubnetRequest::new(&network.id, "10.0.0.0/24".parse()?))?;
    facade.delete_route(&subnet.routes[0].id)?;

    let destinations = ["192.168.0.0/16", "192.168.7.0/24"];
    let barrier = Arc::new(Barrier::new(destinations.len()));
    let mut handles = Vec::new();
    for destination in destinations {
        let facade = facade.clone();
        let barrier = barrier.clone();
        let request = CreateRouteRequest {
            subnet_id: subnet.subnet.id.clone(),
            route: RouteSpec::new(destination.parse()?, "10.0.0.1".parse()?),
        };
        handles.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            facade.create_route(&request)
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => created += 1,
            Err(AllocError::RouteConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error {}", other),
        }
    }
    assert_eq!((created, conflicts), (1, 1));
    assert_eq!(facade.subnet_details(&subnet.subnet.id)?.routes.len(), 1);
    Ok(())
}
