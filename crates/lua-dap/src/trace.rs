//! Runtime trace events, as seen by the debug hook.

use mlua::{Debug, DebugEvent, Lua, Value};

use crate::error::DebugResult;
use crate::introspection::Introspection;

/// Identity of a callable, stable for as long as the callable is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

impl FunctionId {
    pub fn of(value: &mlua::Value) -> Option<FunctionId> {
        match value {
            mlua::Value::Function(_) => Some(FunctionId(value.to_pointer() as usize)),
            _ => None,
        }
    }
}

/// Identity of the coroutine (or main thread) an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ThreadId(pub usize);

impl ThreadId {
    /// The thread `lua` is running on right now.
    pub fn current(lua: &Lua) -> ThreadId {
        ThreadId(Value::Thread(lua.current_thread()).to_pointer() as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Lua,
    Native,
    Main,
}

/// What the runtime reports about a function activation when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub name: Option<String>,
    /// Chunk name as the runtime reports it (`@path`, `=label`, or chunk text).
    pub source: String,
    pub line: u32,
    pub line_defined: u32,
    pub kind: FrameKind,
    pub function: Option<FunctionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Call(FrameInfo),
    TailCall(FrameInfo),
    Line(u32),
    /// `active` is the function that is returning, when the runtime can tell.
    Return { active: Option<FunctionId> },
}

impl TraceEvent {
    /// Translate a hook invocation. `None` for events the debugger does not track.
    pub fn capture(introspection: &Introspection, debug: &Debug) -> DebugResult<Option<Self>> {
        let event = match debug.event() {
            DebugEvent::Call => TraceEvent::Call(introspection.frame_info(0)?.unwrap_or_default()),
            DebugEvent::TailCall => {
                TraceEvent::TailCall(introspection.frame_info(0)?.unwrap_or_default())
            }
            DebugEvent::Line => TraceEvent::Line(debug.curr_line().max(0) as u32),
            DebugEvent::Ret => TraceEvent::Return {
                active: introspection.function_at(0)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn is_line(&self) -> bool {
        matches!(self, TraceEvent::Line(_))
    }
}
