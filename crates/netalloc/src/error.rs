//! Error types for allocation operations.
//!
//! Every error carries the identifiers needed to act on it. Only
//! [`AllocError::Conflict`] is transient; everything else is surfaced as-is.

use netalloc_store::{Retryable, StoreError};
use netalloc_types::{IpPrefix, ParseError};
use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for allocation operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur while allocating addresses or managing routes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Malformed MAC range, MAC address or CIDR text.
    #[error("Invalid range: {0}")]
    InvalidRange(#[from] ParseError),

    /// A route or gateway that cannot be applied to its subnet.
    #[error("Invalid route: {message}")]
    InvalidRoute {
        /// Error message.
        message: String,
    },

    /// No MAC range has free or reusable capacity.
    #[error("MAC address range exhausted")]
    MacAddressRangeExhausted,

    #[error("MAC address range {id} not found")]
    MacAddressRangeNotFound { id: String },

    /// The range still has active MAC addresses.
    #[error("MAC address range {id} has allocated addresses")]
    MacAddressRangeInUse { id: String },

    #[error("No MAC address {address} found")]
    MacAddressNotFound { address: String },

    #[error("MAC address {address} is already allocated")]
    MacAddressInUse { address: String },

    #[error("MAC address {address} is not inside any range")]
    MacAddressNotInRange { address: String },

    /// No subnet on the network has free or reusable capacity.
    #[error("No more IP addresses available on network {network_id}")]
    IpAddressExhausted {
        /// The network that ran dry.
        network_id: String,
    },

    /// An explicitly requested address lies outside every matching subnet.
    #[error("IP address {address} is not inside any subnet of network {network_id}")]
    IpAddressNotInSubnet {
        /// The network searched.
        network_id: String,
        /// The requested address.
        address: IpAddr,
    },

    #[error("IP address {id} not found")]
    IpAddressNotFound { id: String },

    /// The destination overlaps an existing route of the subnet.
    #[error("Route overlaps existing route {route_id} with destination {cidr}")]
    RouteConflict {
        /// The route already holding an overlapping destination.
        route_id: String,
        /// The rejected destination.
        cidr: IpPrefix,
    },

    #[error("Route {id} not found")]
    RouteNotFound { id: String },

    #[error("Subnet {id} not found")]
    SubnetNotFound { id: String },

    /// The subnet still has allocated addresses.
    #[error("Subnet {id} has allocated IP addresses")]
    SubnetInUse { id: String },

    #[error("Network {id} not found")]
    NetworkNotFound { id: String },

    /// Concurrent writers kept winning the commit race.
    #[error("Concurrent update conflict on {table}:{key}")]
    Conflict {
        /// The contested table.
        table: String,
        /// The contested key.
        key: String,
    },

    /// Unexpected storage failure.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// One or more best-effort release steps failed.
    #[error("Port release failed: {}", join_errors(.errors))]
    Release {
        /// Every failure, in the order the steps ran.
        errors: Vec<AllocError>,
    },
}

fn join_errors(errors: &[AllocError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AllocError {
    /// Creates an invalid route error.
    pub fn invalid_route(message: impl Into<String>) -> Self {
        Self::InvalidRoute {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn subnet_not_found(id: impl Into<String>) -> Self {
        Self::SubnetNotFound { id: id.into() }
    }

    pub fn network_not_found(id: impl Into<String>) -> Self {
        Self::NetworkNotFound { id: id.into() }
    }

    pub fn ip_exhausted(network_id: impl Into<String>) -> Self {
        Self::IpAddressExhausted {
            network_id: network_id.into(),
        }
    }

    /// Returns true if the operation may succeed when re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocError::Conflict { .. })
    }
}

impl From<StoreError> for AllocError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { table, key } => AllocError::Conflict { table, key },
            other => AllocError::Store(other),
        }
    }
}

impl Retryable for AllocError {
    fn is_retryable(&self) -> bool {
        AllocError::is_retryable(self)
    }
}
