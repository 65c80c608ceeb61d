//! # SuperService Discovery
//!
//! Service registry client and service finders:
//! - Consul agent API backend plus an in-memory backend
//! - Registration with TCP health checks and symmetric deregistration
//! - Coalescing of concurrent identical lookups
//! - Manual finder and a switchable finder registry

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod backend;
pub mod client;
pub mod coalesce;
pub mod consul;
pub mod finder;
pub mod memory;
pub mod registry;

pub use backend::{RegistryBackend, ServiceCheck, ServiceEntry, ServiceRegistration};
pub use client::{parse_host_port, RegisteredService, RegistryClient};
pub use coalesce::Group;
pub use consul::{ConsulApi, ConsulConfig};
pub use finder::{ManualFinder, ServiceFinder};
pub use memory::MemoryRegistry;
pub use registry::FinderRegistry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::RegistryClient;
    pub use crate::consul::ConsulConfig;
    pub use crate::finder::{ManualFinder, ServiceFinder};
    pub use crate::registry::FinderRegistry;
}
