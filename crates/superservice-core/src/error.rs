//! Error types for SuperService

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for SuperService
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Service name does not match `^[a-zA-Z0-9-]+$`
    #[error("Invalid service name: '{0}'")]
    InvalidServiceName(String),

    /// Address could not be parsed into host:port
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected address
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Registry API failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Discovery (resolution) failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// RPC transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Termination signal received
    #[error("Signal: {0}")]
    Signal(String),

    /// Shutdown requested through the parent cancellation token
    #[error("context canceled")]
    Cancelled,

    /// A background worker returned without error
    #[error("worker {0} has terminated")]
    WorkerTerminated(String),

    /// A background worker failed
    #[error("worker {name} failed: {source}")]
    Worker {
        /// Worker display name
        name: String,
        /// Error returned by the worker
        #[source]
        source: anyhow::Error,
    },

    /// A task ignored cancellation for longer than the grace period
    #[error("Force close: task '{task}' did not stop within the grace period")]
    ForcedClose {
        /// Task name
        task: String,
    },

    /// A virtual listener was closed underneath its server
    #[error("{0} listener closed")]
    ListenerClosed(&'static str),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error was produced by the supervisor's force-close timer
    pub fn is_forced_close(&self) -> bool {
        matches!(self, Error::ForcedClose { .. })
    }

    /// Whether this error was produced while registering an instance
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidServiceName(_) | Error::InvalidAddress { .. } | Error::Registry(_)
        )
    }

    /// Create an invalid address error
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker failure
    pub fn worker(name: impl Into<String>, source: anyhow::Error) -> Self {
        Error::Worker {
            name: name.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_close_kind() {
        let err = Error::ForcedClose {
            task: "grpc".to_string(),
        };
        assert!(err.is_forced_close());
        assert!(err.to_string().contains("grpc"));
        assert!(!Error::Cancelled.is_forced_close());
    }

    #[test]
    fn test_registration_errors() {
        assert!(Error::InvalidServiceName("a_b".to_string()).is_registration_error());
        assert!(Error::invalid_address("nope", "missing port").is_registration_error());
        assert!(Error::Registry("500".to_string()).is_registration_error());
        assert!(!Error::Signal("SIGTERM".to_string()).is_registration_error());
    }

    #[test]
    fn test_worker_error_display() {
        let err = Error::worker("ticker", anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "worker ticker failed: boom");
        assert_eq!(
            Error::WorkerTerminated("ticker".to_string()).to_string(),
            "worker ticker has terminated"
        );
    }
}
