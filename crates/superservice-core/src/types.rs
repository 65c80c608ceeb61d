//! Common types shared across crates

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static VALID_SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").expect("service name pattern compiles"));

/// Check a service name against the registry naming rule (letters, digits, hyphen)
pub fn is_valid_service_name(name: &str) -> bool {
    VALID_SERVICE_NAME.is_match(name)
}

/// Lifecycle state of a running service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Options collected, nothing constructed yet
    Idle,
    /// Sub-servers and interceptors being assembled
    Mounting,
    /// All tasks launched
    Running,
    /// Shutdown triggered, waiting for tasks to exit
    Draining,
    /// Every task has finished
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Idle => write!(f, "idle"),
            ServiceState::Mounting => write!(f, "mounting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Draining => write!(f, "draining"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Logical service name plus optional tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Service name
    pub name: String,
    /// Tag, empty when untagged
    pub tag: String,
}

impl ServiceKey {
    /// Create a key from a name and tag
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Parse `name` or `name:tag`. Only the first colon separates the tag.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((name, tag)) => Self::new(name, tag),
            None => Self::new(name, ""),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_validation() {
        assert!(is_valid_service_name("orders"));
        assert!(is_valid_service_name("orders-v2"));
        assert!(is_valid_service_name("A1"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("orders_v2"));
        assert!(!is_valid_service_name("orders.api"));
        assert!(!is_valid_service_name("orders:blue"));
        assert!(!is_valid_service_name("ordérs"));
    }

    #[test]
    fn test_service_key_parse() {
        assert_eq!(ServiceKey::parse("orders"), ServiceKey::new("orders", ""));
        assert_eq!(
            ServiceKey::parse("orders:blue"),
            ServiceKey::new("orders", "blue")
        );
        assert_eq!(
            ServiceKey::parse("orders:blue:green"),
            ServiceKey::new("orders", "blue:green")
        );
    }

    #[test]
    fn test_service_key_display() {
        assert_eq!(ServiceKey::new("orders", "").to_string(), "orders:");
        assert_eq!(ServiceKey::new("orders", "blue").to_string(), "orders:blue");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Draining.to_string(), "draining");
    }
}
