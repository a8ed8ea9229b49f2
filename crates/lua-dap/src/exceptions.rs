//! Script errors: interception of `error`, the exception stop and the
//! `exceptionInfo` / `setExceptionBreakpoints` requests.
//!
//! The global `error` is replaced by a thin Lua wrapper that hands the
//! message to a native `intercept` function before raising it. While a
//! session is attached the interceptor positions string messages itself,
//! from the shadow stack, so the text the script sees is the text the stop
//! reports even when `error` was tail-called. It only records a
//! [`PendingError`]; the stop happens at the trace event for `intercept`'s
//! return, when the shadow stack can be cut back to the frame that raised.

use mlua::{Function, Lua, Table, Value};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::context::{ExceptionRecord, PendingError, SessionContext, StopInfo, StopReason};
use crate::dap::messages::Request;
use crate::dap::types::ExceptionBreakpointsFilter;
use crate::error::{DebugError, DebugResult};
use crate::handler::DebugHandler;
use crate::stack::chunk_id;
use crate::trace::{FrameKind, FunctionId, TraceEvent};

/// Frames the `error` replacement puts above the frame that called it: the
/// wrapper itself and the native interceptor.
pub const ERROR_PRIMITIVE_LAYERS: usize = 2;

const ERROR_WRAPPER_CHUNK: &str = "=(error)";

const ERROR_WRAPPER: &str = r#"
local raise, intercept, getinfo = ...
return function(message, level)
  if level == nil then level = 1 end
  raise(intercept(message, level, getinfo(1, "t").istailcall))
end
"#;

pub const FILTER_UNCAUGHT: &str = "uncaught";
pub const FILTER_CAUGHT: &str = "caught";

pub fn exception_breakpoint_filters() -> Vec<ExceptionBreakpointsFilter> {
    vec![
        ExceptionBreakpointsFilter {
            filter: FILTER_UNCAUGHT,
            label: "Uncaught Errors",
            default: true,
        },
        ExceptionBreakpointsFilter {
            filter: FILTER_CAUGHT,
            label: "Errors Caught by pcall",
            default: false,
        },
    ]
}

/// Replaces the global `error`. Returns the identity of the interceptor.
///
/// `on_error` receives the message and the level as the script passed it,
/// and returns the positioned message when it could work one out; the
/// wrapper then raises that text with level 0.
pub fn install_error_interceptor<F>(lua: &Lua, on_error: F) -> DebugResult<FunctionId>
where
    F: Fn(&Value, i64) -> Option<String> + 'static,
{
    let globals = lua.globals();
    let raise: Function = globals.get("error")?;
    let getinfo: Function = globals
        .get::<Option<Table>>("debug")?
        .ok_or(DebugError::MissingDebugLibrary)?
        .get("getinfo")?;
    let intercept = lua.create_function(
        move |lua, (message, level, tail): (Value, Value, bool)| {
            // Levels without an integer value are left for `error` to reject.
            let Some(numeric) = integer_level(&level) else {
                return Ok((message, level));
            };
            if let Some(positioned) = on_error(&message, numeric) {
                return Ok((Value::String(lua.create_string(positioned)?), Value::Integer(0)));
            }
            Ok((message, Value::Integer(raise_level(numeric, tail))))
        },
    )?;
    let intercept_id = FunctionId::of(&Value::Function(intercept.clone()))
        .ok_or_else(|| mlua::Error::RuntimeError("interceptor has no identity".to_owned()))?;

    let wrapper: Function = lua
        .load(ERROR_WRAPPER)
        .set_name(ERROR_WRAPPER_CHUNK)
        .call((raise, intercept, getinfo))?;
    globals.set("error", wrapper)?;
    Ok(intercept_id)
}

fn integer_level(level: &Value) -> Option<i64> {
    match level {
        Value::Integer(level) => Some(*level),
        Value::Number(level) if level.fract() == 0.0 => Some(*level as i64),
        Value::String(level) => level.to_str().ok()?.trim().parse().ok(),
        _ => None,
    }
}

/// Level to raise with, from inside the wrapper, when nothing positioned the
/// message. A tail call left no frame behind for level 1 to name.
fn raise_level(level: i64, tail: bool) -> i64 {
    match level {
        ..=0 => level,
        1 if tail => 0,
        _ if tail => level,
        _ => level + 1,
    }
}

/// Positions an error raised through `error` and records it, unless the
/// active filters ignore it. Returns the message the script should see.
///
/// Runs inside the interceptor: the shadow stack ends with the wrapper and
/// the interceptor frames.
pub fn record_error(ctx: &mut SessionContext, message: &Value, level: i64) -> Option<String> {
    if ctx.state.no_debug {
        return None;
    }
    let target_depth = ctx.stack.depth().saturating_sub(ERROR_PRIMITIVE_LAYERS);
    let positioned = match message {
        Value::String(text) => {
            let text: String = text.to_string_lossy().into();
            let thread = ctx.stack.current_thread();
            let raiser = usize::try_from(level - 1).ok().and_then(|index| {
                ctx.stack
                    .visible_frames_below(target_depth)
                    .into_iter()
                    .take_while(|visible| visible.frame.thread == thread)
                    .nth(index)
                    .map(|visible| visible.frame)
            });
            Some(match raiser {
                Some(frame) if level > 0 && frame.line > 0 && frame.kind != FrameKind::Native => {
                    format!("{}:{}: {text}", chunk_id(&frame.source), frame.line)
                }
                _ => text,
            })
        }
        _ => None,
    };

    // A coroutine's errors surface as the results of the resume.
    let caught = ctx.stack.in_coroutine() || ctx.stack.contains_any(&ctx.protected_calls);
    let filters = ctx.state.exception_filters;
    if (caught && !filters.caught) || (!caught && !filters.uncaught) {
        return positioned;
    }

    let text = positioned.clone().unwrap_or_else(|| {
        ctx.introspection
            .tostring(message)
            .unwrap_or_else(|| message.type_name().to_owned())
    });
    let raiser_replaced = ctx
        .stack
        .frames()
        .get(target_depth)
        .is_some_and(|wrapper| wrapper.is_tail_call);
    tracing::debug!(target: "lua_dap.exception", caught, target_depth, raiser_replaced, "error intercepted");
    ctx.pending_error = Some(PendingError {
        message: text,
        target_depth,
        caught,
        raiser_replaced,
    });
    positioned
}

/// Stops with reason `exception`. Uncaught errors end the session on resume.
pub fn report_exception(ctx: &mut SessionContext, message: String, caught: bool) {
    tracing::info!(target: "lua_dap.exception", caught, %message, "script error");
    let mut stop = StopInfo::new(StopReason::Exception);
    stop.description = Some(message.clone());
    if !caught {
        ctx.state.terminate_after_resume = true;
    }
    ctx.exception = Some(ExceptionRecord { message, caught });
    ctx.request_stop(stop);
}

#[derive(Debug, Deserialize)]
struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    filters: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ErrorHandler;

impl ErrorHandler {
    fn exception_info(&self, ctx: &SessionContext) -> DebugResult<JsonValue> {
        let record = ctx.exception.as_ref().ok_or(DebugError::NoException)?;
        Ok(json!({
            "exceptionId": record.message,
            "description": record.message,
            "breakMode": if record.caught { "always" } else { "unhandled" },
            "details": { "message": record.message, "typeName": "error" },
        }))
    }

    fn set_exception_breakpoints(
        &self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<JsonValue> {
        let args: SetExceptionBreakpointsArguments = request.parse_arguments()?;
        let filters = &mut ctx.state.exception_filters;
        filters.uncaught = args.filters.iter().any(|filter| filter == FILTER_UNCAUGHT);
        filters.caught = args.filters.iter().any(|filter| filter == FILTER_CAUGHT);
        tracing::debug!(target: "lua_dap.exception", filters = ?ctx.state.exception_filters, "exception filters set");

        let breakpoints: Vec<JsonValue> = args
            .filters
            .iter()
            .map(|filter| {
                json!({ "verified": filter == FILTER_UNCAUGHT || filter == FILTER_CAUGHT })
            })
            .collect();
        Ok(json!({ "breakpoints": breakpoints }))
    }
}

impl DebugHandler for ErrorHandler {
    fn commands(&self) -> &'static [&'static str] {
        &["exceptionInfo", "setExceptionBreakpoints"]
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<JsonValue>> {
        match request.command.as_str() {
            "exceptionInfo" => self.exception_info(ctx).map(Some),
            "setExceptionBreakpoints" => self.set_exception_breakpoints(ctx, request).map(Some),
            other => Err(DebugError::NotImplemented(other.to_owned())),
        }
    }

    fn on_trace(&mut self, ctx: &mut SessionContext, event: &TraceEvent) -> DebugResult<()> {
        let TraceEvent::Return { active } = event else {
            return Ok(());
        };
        if active.is_none() || *active != ctx.intercept_function {
            return Ok(());
        }
        let Some(pending) = ctx.pending_error.take() else {
            return Ok(());
        };

        // The wrapper is still live above the raising frame.
        let popped = ctx.stack.truncate(pending.target_depth);
        ctx.frame_bias += popped;
        if pending.raiser_replaced {
            // The wrapper is running in the raising function's frame.
            ctx.frame_bias = ctx.frame_bias.saturating_sub(1);
            ctx.vanished_frames = 1;
        }
        if popped > 0 {
            ctx.emit_stack_update(json!({ "action": "pop", "pop_count": popped }));
        }
        report_exception(ctx, pending.message, pending.caught);
        Ok(())
    }

    fn on_continue(&mut self, ctx: &mut SessionContext) {
        ctx.exception = None;
    }
}
