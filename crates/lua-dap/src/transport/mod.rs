//! Message transports between the debugger core and a DAP client.
//!
//! Every transport decodes frames on a background reader thread and queues the
//! results, so the core can poll for pending messages without blocking while
//! the script runs and block on them while it is suspended.

mod memory;
mod pipe;
mod tcp;

pub use memory::{MemoryClient, MemoryTransport};
pub use pipe::PipeTransport;
pub use tcp::TcpTransport;

use crossbeam_channel::Receiver;
use serde_json::Value;
use std::io;

use crate::dap::codec::decode_message;
use crate::error::{DebugError, DebugResult};

/// The contract the session core relies on.
pub trait Transport {
    fn send(&mut self, message: &Value) -> DebugResult<()>;

    /// Blocks until a message arrives. `Ok(None)` once the peer is gone.
    ///
    /// A frame that is not valid JSON yields `Err(DebugError::MalformedMessage)`
    /// and leaves the transport usable.
    fn receive(&mut self) -> DebugResult<Option<Value>>;

    /// Never blocks.
    fn has_pending_message(&mut self) -> bool;

    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, message: &Value) -> DebugResult<()> {
        (**self).send(message)
    }

    fn receive(&mut self) -> DebugResult<Option<Value>> {
        (**self).receive()
    }

    fn has_pending_message(&mut self) -> bool {
        (**self).has_pending_message()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Message(Value),
    Malformed(String),
    Failed(io::Error),
    Closed,
}

/// Spawns the reader thread. `read_frame` returns `Ok(None)` at end of stream.
pub(crate) fn spawn_reader<F>(name: &str, mut read_frame: F) -> io::Result<Receiver<Incoming>>
where
    F: FnMut() -> io::Result<Option<Vec<u8>>> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || loop {
            let incoming = match read_frame() {
                Ok(Some(bytes)) => match decode_message(&bytes) {
                    Ok(value) => Incoming::Message(value),
                    Err(err) => Incoming::Malformed(err.to_string()),
                },
                Ok(None) => Incoming::Closed,
                Err(err) => Incoming::Failed(err),
            };
            let last = matches!(incoming, Incoming::Closed | Incoming::Failed(_));
            if tx.send(incoming).is_err() || last {
                break;
            }
        })?;
    Ok(rx)
}

/// Receiving half shared by every transport.
#[derive(Debug)]
pub(crate) struct Inbox {
    rx: Receiver<Incoming>,
    eof: bool,
}

impl Inbox {
    pub(crate) fn new(rx: Receiver<Incoming>) -> Self {
        Self { rx, eof: false }
    }

    pub(crate) fn receive(&mut self) -> DebugResult<Option<Value>> {
        if self.eof {
            return Ok(None);
        }
        let incoming = self.rx.recv().unwrap_or(Incoming::Closed);
        self.accept(incoming)
    }

    pub(crate) fn has_pending(&mut self) -> bool {
        !self.eof && !self.rx.is_empty()
    }

    fn accept(&mut self, incoming: Incoming) -> DebugResult<Option<Value>> {
        match incoming {
            Incoming::Message(value) => Ok(Some(value)),
            Incoming::Malformed(message) => Err(DebugError::MalformedMessage(message)),
            Incoming::Failed(err) => {
                self.eof = true;
                Err(DebugError::Transport(err))
            }
            Incoming::Closed => {
                self.eof = true;
                Ok(None)
            }
        }
    }
}
