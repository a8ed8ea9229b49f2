//! Buffering for the script's `print` output.
//!
//! `print` runs inside the script, where the session cannot send anything, so
//! lines are queued here and emitted as `output` events at the next trace event
//! or dispatch.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Function, Lua, MultiValue};

/// Bytes kept between two flushes; later lines are dropped and counted.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: String,
    dropped_lines: usize,
}

impl OutputBuffer {
    pub fn push_line(&mut self, line: &str) {
        if self.buf.len() + line.len() > MAX_BUFFERED_BYTES {
            self.dropped_lines += 1;
            return;
        }
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    /// Takes everything buffered so far.
    pub fn take(&mut self) -> Option<String> {
        if self.dropped_lines > 0 {
            self.buf.push_str(&format!(
                "... {} line(s) of output dropped\n",
                std::mem::take(&mut self.dropped_lines)
            ));
        }
        if self.buf.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }
}

/// Replaces the global `print` with one that writes into `buffer`.
pub fn redirect_print(
    lua: &Lua,
    tostring: Function,
    buffer: Rc<RefCell<OutputBuffer>>,
) -> mlua::Result<()> {
    let print = lua.create_function(move |_, args: MultiValue| {
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        buffer.borrow_mut().push_line(&parts.join("\t"));
        Ok(())
    })?;
    lua.globals().set("print", print)
}
