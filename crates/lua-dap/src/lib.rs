//! In-process Debug Adapter Protocol debugger for Lua 5.4 scripts.
//!
//! This crate provides:
//! - [`DebugSession`], which attaches to an `mlua` state through its trace hook
//!   and serves a DAP client while the script runs on the same thread.
//! - Transports for the adapter side of the protocol: length-prefixed pipes,
//!   `Content-Length` framed TCP and an in-memory pair.
//! - The `lua-dap` binary, which runs one script under a session.

pub mod breakpoints;
pub mod context;
pub mod dap;
pub mod error;
pub mod exceptions;
pub mod format;
pub mod handler;
pub mod handles;
pub mod hardening;
pub mod introspection;
pub mod object_registry;
pub mod output;
pub mod runtime;
pub mod session;
pub mod source_map;
pub mod stack;
pub mod stepping;
pub mod trace;
pub mod transport;
pub mod variables;

pub use crate::context::SessionOptions;
pub use crate::error::{DebugError, DebugResult};
pub use crate::session::{DebugSession, TERMINATED_MESSAGE};
pub use crate::source_map::SourceMap;
pub use crate::transport::{MemoryClient, MemoryTransport, PipeTransport, TcpTransport, Transport};
