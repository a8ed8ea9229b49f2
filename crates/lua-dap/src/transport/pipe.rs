use serde_json::Value;
use std::io::{self, Read, Write};

use super::{spawn_reader, Inbox, Transport};
use crate::dap::codec::{encode_message, read_pipe_frame, write_pipe_exit, write_pipe_message, PipeFrame};
use crate::error::{DebugError, DebugResult};

/// Length-prefixed framing over a byte pipe (stdin/stdout of the host bridge).
pub struct PipeTransport {
    inbox: Inbox,
    writer: Option<Box<dyn Write + Send>>,
}

impl PipeTransport {
    pub fn new<R, W>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let mut reader = io::BufReader::new(reader);
        let rx = spawn_reader("lua-dap-pipe-reader", move || {
            match read_pipe_frame(&mut reader)? {
                Some(PipeFrame::Message(bytes)) => Ok(Some(bytes)),
                Some(PipeFrame::Exit) | None => Ok(None),
            }
        })?;
        Ok(Self {
            inbox: Inbox::new(rx),
            writer: Some(Box::new(writer)),
        })
    }

    pub fn stdio() -> io::Result<Self> {
        Self::new(io::stdin(), io::stdout())
    }
}

impl Transport for PipeTransport {
    fn send(&mut self, message: &Value) -> DebugResult<()> {
        let writer = self.writer.as_mut().ok_or(DebugError::Disconnected)?;
        let body = encode_message(message)?;
        write_pipe_message(writer, &body)?;
        Ok(())
    }

    fn receive(&mut self) -> DebugResult<Option<Value>> {
        self.inbox.receive()
    }

    fn has_pending_message(&mut self) -> bool {
        self.inbox.has_pending()
    }

    /// Performs the exit handshake. The reader thread ends with the peer.
    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = write_pipe_exit(&mut writer) {
                tracing::debug!(target: "lua_dap.transport", error = %err, "failed to write exit frame");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}
