//! # Peer Builder
//!
//! Provides a fluent API for configuring a peer before wiring it to a transport.

use std::sync::Arc;
use std::time::Duration;

use crate::peer::Peer;
use crate::system::ScriptLoader;
use crate::transport::Transport;

/// How long a call waits for its reply unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fluent builder for creating peers.
pub struct PeerBuilder {
    name: String,
    call_timeout: Option<Duration>,
    loader: Option<Arc<dyn ScriptLoader>>,
}

impl PeerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            loader: None,
        }
    }

    /// Fails calls with `Error::Timeout` when no reply arrives within `timeout`.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Lets calls wait for their reply indefinitely.
    pub fn no_call_timeout(mut self) -> Self {
        self.call_timeout = None;
        self
    }

    /// Serves the counterpart's `importScripts` requests with `loader`.
    pub fn script_loader(mut self, loader: impl ScriptLoader) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Wires the peer to `transport` and starts its pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self, transport: impl Transport) -> Peer {
        self.build_shared(Arc::new(transport))
    }

    pub fn build_shared(self, transport: Arc<dyn Transport>) -> Peer {
        Peer::start(self.name, transport, self.call_timeout, self.loader)
    }
}
