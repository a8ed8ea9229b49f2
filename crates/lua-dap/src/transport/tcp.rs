use serde_json::Value;
use std::io::{self, BufReader};
use std::net::{Shutdown, TcpStream};

use super::{spawn_reader, Inbox, Transport};
use crate::dap::codec::{encode_message, read_content_length_frame, write_content_length_frame};
use crate::error::{DebugError, DebugResult};

/// DAP base-protocol framing over an outgoing TCP connection to the relay.
pub struct TcpTransport {
    inbox: Inbox,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let rx = spawn_reader("lua-dap-tcp-reader", move || {
            read_content_length_frame(&mut reader)
        })?;
        tracing::info!(
            target: "lua_dap.transport",
            peer = ?stream.peer_addr().ok(),
            "tcp transport connected"
        );
        Ok(Self {
            inbox: Inbox::new(rx),
            stream: Some(stream),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, message: &Value) -> DebugResult<()> {
        let stream = self.stream.as_mut().ok_or(DebugError::Disconnected)?;
        let body = encode_message(message)?;
        write_content_length_frame(stream, &body)?;
        Ok(())
    }

    fn receive(&mut self) -> DebugResult<Option<Value>> {
        self.inbox.receive()
    }

    fn has_pending_message(&mut self) -> bool {
        self.inbox.has_pending()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Unblocks the reader thread as well.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
