//! # SuperService Core
//!
//! Core types and error handling shared by the SuperService crates:
//! - Error types
//! - Service lifecycle state
//! - Service name/tag handling

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{is_valid_service_name, ServiceKey, ServiceState};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::{is_valid_service_name, ServiceKey, ServiceState};
}
