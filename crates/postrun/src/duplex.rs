//! # In-Memory Duplex Transport
//!
//! Two connected ends over tokio channels, for contexts living in the same
//! process (a controller task and a worker task) and for tests.

use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// One end of an in-memory channel.
///
/// Messages sent via `send()` appear on the other end's `recv()` in order.
pub struct DuplexTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl DuplexTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
        };

        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
        };

        (a, b)
    }

    // The guarded state is a single Option, so a poisoned lock is still consistent.
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self.sender();
        let Some(tx) = tx.as_ref() else {
            return Err(transport::Error::ConnectionLost("transport closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("counterpart dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    /// Drops the sending half. The other end sees `Ok(None)` once it has
    /// drained what was already sent; later sends from this end fail.
    fn close(&self) {
        self.sender().take();
    }
}
