//! Wire framings for DAP messages.
//!
//! Two framings are supported:
//!
//! * the DAP base protocol (`Content-Length` headers), used over TCP;
//! * the pipe framing spoken with the host's stdio bridge: a one-byte header
//!   (`EXIT`, `LENGTH`, `MESSAGE`), a 4-byte little-endian length, then the
//!   UTF-8 JSON document.

use serde::Serialize;
use serde_json::Value;
use std::io::{self, BufRead, Read, Write};

pub use super::{MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};

pub const PIPE_HEADER_EXIT: u8 = 0;
pub const PIPE_HEADER_LENGTH: u8 = 1;
pub const PIPE_HEADER_MESSAGE: u8 = 2;

/// Strip user-provided values out of a `serde_json` error message.
///
/// `serde_json::Error` display strings can include scalar values (`invalid type: string "..."`)
/// or field names (`unknown field `...``). DAP payloads carry evaluated expressions and launch
/// arguments, so those never end up in logs or error responses.
pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // Only the first backticked segment: keep the "expected one of" list actionable.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

/// Parse one JSON document received from the client.
pub fn decode_message(bytes: &[u8]) -> io::Result<Value> {
    serde_json::from_slice(bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            sanitize_json_error_message(&err.to_string()),
        )
    })
}

pub fn encode_message<T: Serialize>(message: &T) -> io::Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            sanitize_json_error_message(&err.to_string()),
        )
    })
}

fn check_length(length: usize) -> io::Result<()> {
    if length > MAX_DAP_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "DAP message length {length} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            ),
        ));
    }
    Ok(())
}

fn read_line_limited<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::<u8>::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("DAP header line exceeds maximum size ({max_len} bytes)"),
            ));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DAP header line is not UTF-8"))?;
    Ok(Some(line))
}

/// Read one `Content-Length` framed body. `Ok(None)` on a clean EOF between messages.
pub fn read_content_length_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header_line = false;

    loop {
        let Some(line) = read_line_limited(reader, MAX_DAP_HEADER_LINE_BYTES)? else {
            if !saw_header_line {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF while reading DAP headers",
            ));
        };
        saw_header_line = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid Content-Length {value:?}: {err}"),
                    )
                })?);
            }
        }
    }

    let Some(content_length) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "DAP message missing Content-Length header",
        ));
    };
    check_length(content_length)?;

    let mut buf = vec![0u8; content_length];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_content_length_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(body)?;
    writer.flush()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeFrame {
    Message(Vec<u8>),
    Exit,
}

fn read_byte<R: Read>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Read one pipe frame. `Ok(None)` on EOF before a header byte.
///
/// Any header other than `LENGTH` at the top level counts as `EXIT`; once a
/// `LENGTH` header has been seen, a truncated or malformed frame is an error.
pub fn read_pipe_frame<R: Read>(reader: &mut R) -> io::Result<Option<PipeFrame>> {
    let header = match read_byte(reader)? {
        None => return Ok(None),
        Some(header) => header,
    };
    if header != PIPE_HEADER_LENGTH {
        if header != PIPE_HEADER_EXIT {
            tracing::debug!(
                target: "lua_dap.transport",
                header,
                "unknown pipe header treated as exit"
            );
        }
        return Ok(Some(PipeFrame::Exit));
    }

    let mut length = [0u8; 4];
    reader.read_exact(&mut length)?;
    let length = u32::from_le_bytes(length) as usize;
    check_length(length)?;

    match read_byte(reader)? {
        Some(PIPE_HEADER_MESSAGE) => {}
        Some(other) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected MESSAGE header after LENGTH, got {other}"),
            ))
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before MESSAGE header",
            ))
        }
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok(Some(PipeFrame::Message(body)))
}

pub fn write_pipe_message<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    check_length(body.len())?;
    let length = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "message too large"))?;
    writer.write_all(&[PIPE_HEADER_LENGTH])?;
    writer.write_all(&length.to_le_bytes())?;
    writer.write_all(&[PIPE_HEADER_MESSAGE])?;
    writer.write_all(body)?;
    writer.flush()
}

pub fn write_pipe_exit<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[PIPE_HEADER_EXIT])?;
    writer.flush()
}
