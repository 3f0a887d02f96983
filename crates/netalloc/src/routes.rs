//! Route and gateway bookkeeping for subnets.
//!
//! A subnet's gateway is not stored on its own: it is the gateway of the
//! subnet's default route (the route to `0.0.0.0/0` or `::/0`). No two routes
//! of a subnet may overlap, which makes the default route exclusive within
//! its address family.

use crate::error::{AllocError, AllocResult};
use chrono::{DateTime, Utc};
use netalloc_store::records::{DnsNameserver, IpAddressEntry, IpPolicy, Network, Route, Subnet};
use netalloc_store::Transaction;
use netalloc_types::{IpPrefix, IpVersion};
use std::net::IpAddr;
use tracing::{debug, info};

pub use netalloc_types::overlaps;

/// A route as supplied by a caller, before it has an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: IpPrefix,
    pub gateway: IpAddr,
}

impl RouteSpec {
    pub fn new(destination: IpPrefix, gateway: IpAddr) -> Self {
        Self {
            destination,
            gateway,
        }
    }

    /// A route to the wildcard network of the gateway's family.
    pub fn default_via(gateway: IpAddr) -> Self {
        Self::new(IpPrefix::wildcard(IpVersion::of(&gateway)), gateway)
    }

    pub fn is_default(&self) -> bool {
        self.destination.is_default()
    }
}

/// The routes a subnet ends up with, and the gateway they imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub gateway_ip: Option<IpAddr>,
    pub routes: Vec<RouteSpec>,
}

/// Derives the route set of a new subnet.
///
/// A caller-supplied default route wins and supplies the gateway. Otherwise a
/// default route is appended, pointing at `explicit_gateway` or, without
/// one, at the first address after the network address.
///
/// ```
/// use netalloc::routes::synthesize_default_route;
///
/// let plan = synthesize_default_route(&"10.0.0.0/24".parse().unwrap(), None, Vec::new());
/// assert_eq!(plan.gateway_ip, Some("10.0.0.1".parse().unwrap()));
/// assert_eq!(plan.routes.len(), 1);
/// assert!(plan.routes[0].is_default());
/// ```
pub fn synthesize_default_route(
    cidr: &IpPrefix,
    explicit_gateway: Option<IpAddr>,
    mut routes: Vec<RouteSpec>,
) -> RoutePlan {
    if let Some(default) = routes.iter().find(|route| route.is_default()) {
        return RoutePlan {
            gateway_ip: Some(default.gateway),
            routes,
        };
    }

    let gateway_ip = explicit_gateway.or_else(|| cidr.nth(1));
    if let Some(gateway) = gateway_ip {
        routes.push(RouteSpec::default_via(gateway));
    }
    RoutePlan { gateway_ip, routes }
}

/// The gateway implied by a route set.
pub fn gateway_of(routes: &[Route]) -> Option<IpAddr> {
    routes
        .iter()
        .find(|route| route.cidr.is_default())
        .map(|route| route.gateway)
}

fn check_route_family(spec: &RouteSpec) -> AllocResult<()> {
    if IpVersion::of(&spec.gateway) != spec.destination.version() {
        return Err(AllocError::invalid_route(format!(
            "gateway {} does not match destination {}",
            spec.gateway, spec.destination
        )));
    }
    Ok(())
}

/// Builds route records for a subnet, rejecting any pair that overlaps.
fn plan_routes(subnet_id: &str, specs: &[RouteSpec]) -> AllocResult<Vec<Route>> {
    let mut planned: Vec<Route> = Vec::with_capacity(specs.len());
    for spec in specs {
        check_route_family(spec)?;
        if let Some(existing) = planned.iter().find(|r| overlaps(&r.cidr, &spec.destination)) {
            return Err(AllocError::RouteConflict {
                route_id: existing.id.clone(),
                cidr: spec.destination,
            });
        }
        planned.push(Route::new(subnet_id, spec.destination, spec.gateway));
    }
    Ok(planned)
}

fn lock_subnet<T: Transaction>(tx: &mut T, id: &str) -> AllocResult<Subnet> {
    if tx.get::<Subnet>(id)?.is_none() {
        return Err(AllocError::subnet_not_found(id));
    }
    Ok(tx.lock::<Subnet>(id)?)
}

/// Parameters of a single route creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRouteRequest {
    pub subnet_id: String,
    pub route: RouteSpec,
}

/// Adds a route to a subnet unless it overlaps an existing one.
pub fn create_route<T: Transaction>(tx: &mut T, request: &CreateRouteRequest) -> AllocResult<Route> {
    // every writer to the route set locks the subnet first
    lock_subnet(tx, &request.subnet_id)?;
    check_route_family(&request.route)?;

    let destination = request.route.destination;
    for existing in list_routes(tx, &request.subnet_id)? {
        if overlaps(&existing.cidr, &destination) {
            debug!(%destination, existing = %existing.cidr, "Route overlaps existing route");
            return Err(AllocError::RouteConflict {
                route_id: existing.id,
                cidr: destination,
            });
        }
    }

    let route = Route::new(&request.subnet_id, destination, request.route.gateway);
    tx.create(&route)?;
    info!(id = %route.id, %destination, gateway = %route.gateway, "Created route");
    Ok(route)
}

pub fn get_route<T: Transaction>(tx: &mut T, id: &str) -> AllocResult<Route> {
    tx.get::<Route>(id)?
        .ok_or_else(|| AllocError::RouteNotFound { id: id.to_string() })
}

/// Routes of a subnet in creation order.
pub fn list_routes<T: Transaction>(tx: &mut T, subnet_id: &str) -> AllocResult<Vec<Route>> {
    Ok(tx.find_indexed::<Route>(&Route::by_subnet(subnet_id))?)
}

pub fn delete_route<T: Transaction>(tx: &mut T, id: &str) -> AllocResult<Route> {
    let route = get_route(tx, id)?;
    lock_subnet(tx, &route.subnet_id)?;
    tx.delete::<Route>(id)?;
    info!(id, destination = %route.cidr, "Deleted route");
    Ok(route)
}

/// Parameters of a new subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSubnetRequest {
    pub network_id: String,
    pub cidr: IpPrefix,
    pub name: String,
    pub gateway_ip: Option<IpAddr>,
    pub host_routes: Vec<RouteSpec>,
    pub dns_nameservers: Vec<IpAddr>,
    pub ip_policy: Option<IpPolicy>,
}

impl CreateSubnetRequest {
    pub fn new(network_id: impl Into<String>, cidr: IpPrefix) -> Self {
        Self {
            network_id: network_id.into(),
            cidr,
            name: String::new(),
            gateway_ip: None,
            host_routes: Vec::new(),
            dns_nameservers: Vec::new(),
            ip_policy: None,
        }
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway_ip = Some(gateway);
        self
    }

    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.host_routes.push(route);
        self
    }

    pub fn with_dns(mut self, nameserver: IpAddr) -> Self {
        self.dns_nameservers.push(nameserver);
        self
    }

    pub fn with_policy(mut self, policy: IpPolicy) -> Self {
        self.ip_policy = Some(policy);
        self
    }
}

/// Changes to an existing subnet. `None` leaves a field untouched; a list
/// replaces the stored one entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSubnetRequest {
    pub name: Option<String>,
    pub gateway_ip: Option<IpAddr>,
    pub host_routes: Option<Vec<RouteSpec>>,
    pub dns_nameservers: Option<Vec<IpAddr>>,
}

/// A subnet with its routes, gateway and nameservers.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetDetails {
    pub subnet: Subnet,
    pub gateway_ip: Option<IpAddr>,
    pub routes: Vec<Route>,
    pub dns_nameservers: Vec<IpAddr>,
}

/// Creates a subnet together with its planned routes and nameservers.
pub fn create_subnet<T: Transaction>(
    tx: &mut T,
    request: &CreateSubnetRequest,
    now: DateTime<Utc>,
) -> AllocResult<SubnetDetails> {
    if tx.get::<Network>(&request.network_id)?.is_none() {
        return Err(AllocError::network_not_found(&request.network_id));
    }
    if let Some(gateway) = request.gateway_ip {
        if IpVersion::of(&gateway) != request.cidr.version() {
            return Err(AllocError::invalid_route(format!(
                "gateway {} does not match subnet {}",
                gateway, request.cidr
            )));
        }
    }

    let mut subnet = Subnet::new(&request.network_id, request.cidr, now);
    subnet.name = request.name.clone();
    subnet.ip_policy = request.ip_policy.clone();

    let plan = synthesize_default_route(&request.cidr, request.gateway_ip, request.host_routes.clone());
    let routes = plan_routes(&subnet.id, &plan.routes)?;

    tx.create(&subnet)?;
    for route in &routes {
        tx.create(route)?;
    }
    for ip in &request.dns_nameservers {
        tx.create(&DnsNameserver::new(&subnet.id, *ip))?;
    }

    info!(
        id = %subnet.id,
        cidr = %subnet.cidr,
        gateway = ?plan.gateway_ip,
        routes = routes.len(),
        "Created subnet"
    );
    Ok(SubnetDetails {
        subnet,
        gateway_ip: plan.gateway_ip,
        routes,
        dns_nameservers: request.dns_nameservers.clone(),
    })
}

/// Applies an update to a subnet's name, routes, gateway and nameservers.
pub fn update_subnet<T: Transaction>(
    tx: &mut T,
    id: &str,
    request: &UpdateSubnetRequest,
) -> AllocResult<SubnetDetails> {
    let mut subnet = lock_subnet(tx, id)?;

    if let Some(name) = &request.name {
        subnet.name = name.clone();
        tx.update(&subnet)?;
    }

    let mut routes = list_routes(tx, id)?;
    let requested_default = match &request.host_routes {
        Some(specs) => {
            let replacement = plan_routes(id, specs)?;
            for route in &routes {
                tx.delete::<Route>(&route.id)?;
            }
            for route in &replacement {
                tx.create(route)?;
            }
            debug!(subnet = id, count = replacement.len(), "Replaced routes");
            routes = replacement;
            specs.iter().any(RouteSpec::is_default)
        }
        None => false,
    };

    if let Some(gateway) = request.gateway_ip.filter(|_| !requested_default) {
        if IpVersion::of(&gateway) != subnet.ip_version {
            return Err(AllocError::invalid_route(format!(
                "gateway {} does not match subnet {}",
                gateway, subnet.cidr
            )));
        }
        match routes.iter_mut().find(|route| route.cidr.is_default()) {
            Some(default) => {
                default.gateway = gateway;
                tx.update(&*default)?;
            }
            None => {
                let spec = RouteSpec::default_via(gateway);
                if let Some(existing) = routes.iter().find(|r| overlaps(&r.cidr, &spec.destination)) {
                    return Err(AllocError::RouteConflict {
                        route_id: existing.id.clone(),
                        cidr: spec.destination,
                    });
                }
                let route = Route::new(id, spec.destination, gateway);
                tx.create(&route)?;
                routes.push(route);
            }
        }
        debug!(subnet = id, %gateway, "Updated gateway");
    }

    if let Some(nameservers) = &request.dns_nameservers {
        for existing in tx.find_indexed::<DnsNameserver>(&DnsNameserver::by_subnet(id))? {
            tx.delete::<DnsNameserver>(&existing.id)?;
        }
        for ip in nameservers {
            tx.create(&DnsNameserver::new(id, *ip))?;
        }
    }

    info!(id, cidr = %subnet.cidr, "Updated subnet");
    subnet_details(tx, id)
}

/// Removes a subnet with its routes, nameservers and deallocated addresses.
///
/// Refused while any address of the subnet is still allocated.
pub fn delete_subnet<T: Transaction>(tx: &mut T, id: &str) -> AllocResult<()> {
    lock_subnet(tx, id)?;
    let addresses = tx.find_indexed::<IpAddressEntry>(&IpAddressEntry::by_subnet(id))?;
    if addresses.iter().any(|entry| !entry.deallocated) {
        return Err(AllocError::SubnetInUse { id: id.to_string() });
    }

    for entry in &addresses {
        crate::ip::delete_entry(tx, &entry.id)?;
    }
    for route in list_routes(tx, id)? {
        tx.delete::<Route>(&route.id)?;
    }
    for nameserver in tx.find_indexed::<DnsNameserver>(&DnsNameserver::by_subnet(id))? {
        tx.delete::<DnsNameserver>(&nameserver.id)?;
    }
    tx.delete::<Subnet>(id)?;
    info!(id, "Deleted subnet");
    Ok(())
}

pub fn subnet_details<T: Transaction>(tx: &mut T, id: &str) -> AllocResult<SubnetDetails> {
    let subnet = tx
        .get::<Subnet>(id)?
        .ok_or_else(|| AllocError::subnet_not_found(id))?;
    let routes = list_routes(tx, id)?;
    let dns_nameservers = tx
        .find_indexed::<DnsNameserver>(&DnsNameserver::by_subnet(id))?
        .into_iter()
        .map(|ns| ns.ip)
        .collect();
    Ok(SubnetDetails {
        gateway_ip: gateway_of(&routes),
        subnet,
        routes,
        dns_nameservers,
    })
}
