use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use std::time::Duration;

use super::{Inbox, Incoming, Transport};
use crate::dap::codec::decode_message;
use crate::error::{DebugError, DebugResult};

/// In-process transport, for embedding hosts and tests.
#[derive(Debug)]
pub struct MemoryTransport {
    inbox: Inbox,
    outgoing: Option<Sender<Value>>,
}

/// The client end of a [`MemoryTransport`]. Dropping it reads as EOF on the adapter side.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    tx: Sender<Incoming>,
    rx: Receiver<Value>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryClient) {
        let (client_tx, adapter_rx) = crossbeam_channel::unbounded();
        let (adapter_tx, client_rx) = crossbeam_channel::unbounded();
        (
            MemoryTransport {
                inbox: Inbox::new(adapter_rx),
                outgoing: Some(adapter_tx),
            },
            MemoryClient {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &Value) -> DebugResult<()> {
        let outgoing = self.outgoing.as_ref().ok_or(DebugError::Disconnected)?;
        outgoing
            .send(message.clone())
            .map_err(|_| DebugError::Disconnected)
    }

    fn receive(&mut self) -> DebugResult<Option<Value>> {
        self.inbox.receive()
    }

    fn has_pending_message(&mut self) -> bool {
        self.inbox.has_pending()
    }

    fn close(&mut self) {
        self.outgoing = None;
    }

    fn is_connected(&self) -> bool {
        self.outgoing.is_some()
    }
}

impl MemoryClient {
    /// Returns `false` once the adapter side is gone.
    pub fn send(&self, message: Value) -> bool {
        self.tx.send(Incoming::Message(message)).is_ok()
    }

    /// Sends raw text as if it were one decoded frame.
    pub fn send_raw(&self, text: &str) -> bool {
        let incoming = match decode_message(text.as_bytes()) {
            Ok(value) => Incoming::Message(value),
            Err(err) => Incoming::Malformed(err.to_string()),
        };
        self.tx.send(incoming).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Value, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}
