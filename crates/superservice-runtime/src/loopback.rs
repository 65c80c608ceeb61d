//! Self-loopback RPC channel
//!
//! Introspection features (the debug UI and REST gateways) talk to this
//! process's own RPC server as an ordinary client. The channel is created
//! once the listener is bound and lives until shutdown.
//!
//! Consumers hold a [`SelfChannel`] and call [`SelfChannel::get`] per call.
//! A `Channel` cloned out earlier stays usable after [`SelfChannel::close`].

use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use superservice_core::{Error, Result};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Maximum decoded message size for calls made over the self channel
pub const MAX_DECODING_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Shared handle to the self channel
#[derive(Debug, Clone, Default)]
pub struct SelfChannel {
    channel: Arc<Mutex<Option<Channel>>>,
}

impl SelfChannel {
    /// Channel to `127.0.0.1:<port of addr>`, connected on first use
    pub fn dial(addr: SocketAddr) -> Result<Self> {
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()));
        let channel = Endpoint::from_shared(format!("http://{target}"))
            .map_err(|e| Error::Transport(format!("Gateway dialing to grpc: {e}")))?
            .connect_lazy();

        debug!(target = %target, "Initialized self connection");
        Ok(Self {
            channel: Arc::new(Mutex::new(Some(channel))),
        })
    }

    /// The channel, unless closed
    pub fn get(&self) -> Option<Channel> {
        self.channel.lock().clone()
    }

    /// Drop this handle's channel; returns whether one was open
    pub fn close(&self) -> bool {
        self.channel.lock().take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_close() {
        let channel = SelfChannel::dial("0.0.0.0:50051".parse().unwrap()).unwrap();
        let shared = channel.clone();

        assert!(shared.get().is_some());
        assert!(channel.close());
        assert!(shared.get().is_none());
        assert!(!shared.close());
    }

    #[test]
    fn test_default_is_closed() {
        assert!(SelfChannel::default().get().is_none());
    }
}
