//! # SuperService Runtime
//!
//! Serves RPC and HTTP on one TCP port and supervises everything running
//! behind it as a single unit:
//! - Connection multiplexing by protocol signature
//! - Any-exit-stops-all supervision with a bounded grace period
//! - Signal-driven graceful stop
//! - Self-loopback channel for the debug UI and REST gateways
//! - Registration through the active service finder

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod dial;
pub mod gateway;
pub mod loopback;
pub mod mux;
pub mod rpc;
pub mod service;
pub mod signal;
pub mod supervisor;
pub mod ui;
pub mod worker;

#[cfg(unix)]
mod profiling;
mod routes;

pub use dial::{dial, dial_with_tag, dial_with_timeout, discover_service, discover_service_with_tag};
pub use gateway::{GatewayContext, GatewayError, GatewayRegistrar, HeaderMapper, RouterOption};
pub use loopback::SelfChannel;
pub use mux::{Multiplexer, MuxListener, MuxedStream, Protocol};
pub use rpc::{Interceptor, InterceptorChain, ServerOption};
pub use service::SuperService;
pub use supervisor::{MountTask, RunningGroup, StateHandle, Supervision, Supervisor};
pub use ui::{describe_services, MethodDescription, ServiceDescription};
pub use worker::Worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::gateway::{GatewayContext, HeaderMapper};
    pub use crate::service::SuperService;
    pub use crate::supervisor::{MountTask, Supervisor};
    pub use crate::worker::Worker;
    pub use superservice_core::{Error, Result, ServiceState};
    pub use superservice_discovery::{FinderRegistry, ServiceFinder};
}
