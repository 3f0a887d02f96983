//! Driver interface for the network fabric behind the allocator.
//!
//! The allocation core never calls a backend; the CRUD glue that owns
//! ports and networks does, after addresses have been assigned.

use netalloc_types::MacAddress;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend rejected {operation} for {id}: {message}")]
    Rejected {
        operation: &'static str,
        id: String,
        message: String,
    },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A port as handed to the fabric, with its assigned addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPort {
    pub id: String,
    pub network_id: String,
    pub mac_address: MacAddress,
    pub addresses: Vec<IpAddr>,
}

/// Provisions networks and ports on the fabric.
pub trait NetworkBackend: Send + Sync {
    fn create_network(&self, network_id: &str, name: &str) -> BackendResult<()>;
    fn delete_network(&self, network_id: &str) -> BackendResult<()>;
    fn create_port(&self, port: &BackendPort) -> BackendResult<()>;
    fn delete_port(&self, port_id: &str) -> BackendResult<()>;
}
