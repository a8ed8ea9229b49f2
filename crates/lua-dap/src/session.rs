//! The session controller: protocol dispatch, the trace hook and the
//! suspend loop.
//!
//! A session is driven entirely from the thread that runs the script. The
//! hook installed on the runtime forwards every call, line and return event
//! to the handlers, then polls the transport; when a handler asks for a stop
//! the hook itself blocks, answering requests until one resumes execution.
//!
//! Everything the hook, the `error` interceptor and the handlers share lives in
//! [`SessionCore`] behind `Rc<RefCell<_>>`. Callbacks the runtime owns only
//! keep a [`Weak`] reference and skip their work while the core is busy, which
//! is what keeps code run on behalf of the debugger (`evaluate`, getters) from
//! re-entering it.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};

use mlua::{Debug, Function, HookTriggers, Lua, Value, VmState};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::breakpoints::BreakpointManager;
use crate::context::{Messenger, PostAction, SessionContext, SessionOptions, THREAD_ID};
use crate::dap::messages::Request;
use crate::error::{DebugError, DebugResult};
use crate::exceptions::{
    exception_breakpoint_filters, install_error_interceptor, record_error, report_exception,
    ErrorHandler,
};
use crate::handler::DebugHandler;
use crate::introspection::Introspection;
use crate::output::redirect_print;
use crate::runtime::error_message;
use crate::stack::{StackTraceHandler, MAIN_FRAME_NAME};
use crate::stepping::StepController;
use crate::trace::{FunctionId, ThreadId, TraceEvent};
use crate::transport::Transport;
use crate::variables::VariableInspector;

/// Commands the session answers itself, ahead of any handler.
const SESSION_COMMANDS: &[&str] = &[
    "initialize",
    "launch",
    "attach",
    "configurationDone",
    "threads",
    "disconnect",
    "terminate",
];

/// Message of the error raised into the script after `terminate`.
pub const TERMINATED_MESSAGE: &str = "debug session terminated";

/// Protected-call primitives known at connect time.
const PROTECTED_CALLS: &[&str] = &["pcall", "xpcall"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LaunchArguments {
    stop_on_entry: bool,
    no_debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DisconnectArguments {
    terminate_debuggee: bool,
}

/// A global the session replaced, and what to put back when it goes away.
struct ReplacedGlobal {
    name: &'static str,
    original: Value,
    installed: Value,
}

struct SessionCore {
    ctx: SessionContext,
    handlers: Vec<Box<dyn DebugHandler>>,
    /// Command name to index into `handlers`.
    routes: HashMap<&'static str, usize>,
    replaced: Vec<ReplacedGlobal>,
    hooked: bool,
}

impl SessionCore {
    fn new(ctx: SessionContext) -> Self {
        // Trace events reach handlers in this order; the stack tracker must be first.
        let handlers: Vec<Box<dyn DebugHandler>> = vec![
            Box::new(StackTraceHandler::default()),
            Box::new(BreakpointManager::default()),
            Box::new(StepController::default()),
            Box::new(VariableInspector::default()),
            Box::new(ErrorHandler),
        ];
        let mut routes = HashMap::new();
        for (index, handler) in handlers.iter().enumerate() {
            for command in handler.commands() {
                routes.entry(*command).or_insert(index);
            }
        }
        Self {
            ctx,
            handlers,
            routes,
            replaced: Vec::new(),
            hooked: false,
        }
    }

    fn abort_check(&self) -> mlua::Result<VmState> {
        if self.ctx.state.abort {
            return Err(mlua::Error::RuntimeError(TERMINATED_MESSAGE.to_owned()));
        }
        Ok(VmState::Continue)
    }

    fn on_hook(&mut self, lua: &Lua, debug: &Debug) -> mlua::Result<VmState> {
        if self.ctx.state.abort {
            return self.abort_check();
        }
        if self.ctx.state.no_debug {
            self.pump_pending();
            return self.abort_check();
        }

        let event = match TraceEvent::capture(&self.ctx.introspection, debug) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(VmState::Continue),
            Err(err) => {
                tracing::warn!(target: "lua_dap.session", error = %err, "failed to read trace event");
                return Ok(VmState::Continue);
            }
        };

        self.ctx.current_thread = ThreadId::current(lua);
        self.ctx.frame_bias = 0;
        self.ctx.vanished_frames = 0;
        for handler in &mut self.handlers {
            if let Err(err) = handler.on_trace(&mut self.ctx, &event) {
                tracing::warn!(target: "lua_dap.session", error = %err, "trace handler failed");
            }
        }
        self.ctx.flush_output();

        self.pump_pending();
        if self.ctx.state.stopped {
            self.suspend();
        }
        self.abort_check()
    }

    /// Dispatches whatever the client already sent, without blocking.
    fn pump_pending(&mut self) {
        while self.ctx.messenger.is_connected() && self.ctx.messenger.has_pending_message() {
            if !self.pump_one() {
                break;
            }
        }
    }

    /// Receives and dispatches one message. `false` once the client is gone.
    fn pump_one(&mut self) -> bool {
        match self.ctx.messenger.receive() {
            Ok(Some(message)) => {
                self.dispatch(message);
                true
            }
            Ok(None) => {
                tracing::info!(target: "lua_dap.session", "client closed the connection");
                self.detach();
                false
            }
            Err(err @ DebugError::MalformedMessage(_)) => {
                tracing::debug!(target: "lua_dap.session", error = %err, "malformed message");
                self.ctx.messenger.send_error(None, &err);
                true
            }
            Err(err) => {
                tracing::warn!(target: "lua_dap.session", error = %err, "transport failed");
                self.detach();
                false
            }
        }
    }

    fn dispatch(&mut self, message: JsonValue) {
        self.ctx.flush_output();
        let request = match Request::from_value(message) {
            Ok(request) => request,
            Err(err) => {
                self.ctx.messenger.send_error(None, &err);
                return;
            }
        };
        if !request.is_request() {
            let what = if request.command.is_empty() {
                request.type_.clone()
            } else {
                request.command.clone()
            };
            self.ctx
                .messenger
                .send_error(Some(&request), &DebugError::NotImplemented(what));
            return;
        }
        self.ctx.messenger.observe_client_seq(request.seq);
        tracing::debug!(target: "lua_dap.session", command = %request.command, seq = request.seq, "request");

        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| self.route(&request))) {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(target: "lua_dap.session", command = %request.command, "panic in request handler");
                Err(DebugError::Internal(format!(
                    "panic while handling {}",
                    request.command
                )))
            }
        };
        match result {
            Ok(body) => self.ctx.messenger.send_response(&request, body),
            Err(err) => {
                tracing::debug!(target: "lua_dap.session", command = %request.command, error = %err, "request failed");
                self.ctx.messenger.send_error(Some(&request), &err);
            }
        }

        for action in std::mem::take(&mut self.ctx.post_actions) {
            self.run_post_action(action);
        }
    }

    fn route(&mut self, request: &Request) -> DebugResult<Option<JsonValue>> {
        let command = request.command.as_str();
        if SESSION_COMMANDS.contains(&command) {
            return self.handle_session_request(request);
        }
        let index = *self
            .routes
            .get(command)
            .ok_or_else(|| DebugError::NotImplemented(command.to_owned()))?;
        self.handlers[index].handle_request(&mut self.ctx, request)
    }

    fn handle_session_request(&mut self, request: &Request) -> DebugResult<Option<JsonValue>> {
        let ctx = &mut self.ctx;
        match request.command.as_str() {
            "initialize" => {
                ctx.after_response(PostAction::Event("initialized", None));
                Ok(Some(json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsEvaluateForHovers": true,
                    "supportsExceptionInfoRequest": true,
                    "supportsTerminateRequest": true,
                    "supportsDelayedStackTraceLoading": true,
                    "supportsConditionalBreakpoints": false,
                    "supportsHitConditionalBreakpoints": false,
                    "supportsLogPoints": false,
                    "supportsSetVariable": false,
                    "supportsStepBack": false,
                    "exceptionBreakpointFilters": exception_breakpoint_filters(),
                })))
            }
            "launch" | "attach" => {
                let args: LaunchArguments = request.parse_arguments()?;
                ctx.state.launched = true;
                ctx.state.stop_on_entry =
                    (args.stop_on_entry || ctx.options.stop_on_entry) && !args.no_debug;
                ctx.state.no_debug = args.no_debug;
                tracing::info!(
                    target: "lua_dap.session",
                    stop_on_entry = ctx.state.stop_on_entry,
                    no_debug = ctx.state.no_debug,
                    "launched"
                );
                Ok(None)
            }
            "configurationDone" => {
                ctx.resume();
                Ok(None)
            }
            "threads" => Ok(Some(json!({
                "threads": [{ "id": THREAD_ID, "name": MAIN_FRAME_NAME }],
            }))),
            "disconnect" => {
                let args: DisconnectArguments = request.parse_arguments()?;
                ctx.after_response(if args.terminate_debuggee {
                    PostAction::Terminate
                } else {
                    PostAction::Detach
                });
                Ok(None)
            }
            "terminate" => {
                ctx.after_response(PostAction::Terminate);
                Ok(None)
            }
            other => Err(DebugError::NotImplemented(other.to_owned())),
        }
    }

    fn run_post_action(&mut self, action: PostAction) {
        match action {
            PostAction::Event(event, body) => self.ctx.messenger.send_event(event, body),
            PostAction::Detach => self.detach(),
            PostAction::Terminate => self.terminate(),
        }
    }

    /// Announces the stop, then serves requests until one resumes execution.
    fn suspend(&mut self) {
        if let Some(stop) = &self.ctx.state.stop {
            tracing::debug!(target: "lua_dap.session", reason = stop.reason.as_str(), "suspended");
            let body = stop.body();
            self.ctx.messenger.send_event("stopped", Some(body));
        }
        for handler in &mut self.handlers {
            handler.on_stop(&mut self.ctx);
        }

        while self.ctx.state.stopped {
            if !self.pump_one() {
                break;
            }
        }

        self.ctx.state.stop = None;
        for handler in &mut self.handlers {
            handler.on_continue(&mut self.ctx);
        }
        if self.ctx.state.terminate_after_resume {
            tracing::info!(target: "lua_dap.session", "ending session after an uncaught error");
            self.deinit();
        }
    }

    fn remove_hook(&mut self) {
        if self.hooked {
            self.ctx.lua.remove_hook();
            self.hooked = false;
        }
    }

    /// Puts back `print` and `error` unless the script replaced them itself.
    fn restore_globals(&mut self) {
        let globals = self.ctx.lua.globals();
        for replaced in self.replaced.drain(..) {
            let current = globals.raw_get::<Value>(replaced.name).unwrap_or(Value::Nil);
            if current.to_pointer() != replaced.installed.to_pointer() {
                continue;
            }
            if let Err(err) = globals.raw_set(replaced.name, replaced.original) {
                tracing::debug!(target: "lua_dap.session", name = replaced.name, error = %err, "failed to restore global");
            }
        }
    }

    /// Stops debugging but lets the script run on.
    fn detach(&mut self) {
        tracing::info!(target: "lua_dap.session", "detaching");
        self.remove_hook();
        self.restore_globals();
        self.ctx.flush_output();
        self.ctx.messenger.close();
        self.ctx.state.launched = true;
        self.ctx.resume();
    }

    /// Ends the session and makes the next trace event raise into the script.
    fn terminate(&mut self) {
        tracing::info!(target: "lua_dap.session", "terminating script");
        self.ctx.flush_output();
        self.ctx.messenger.send_event("terminated", None);
        self.ctx.messenger.close();
        self.restore_globals();
        self.ctx.state.abort = true;
        self.ctx.state.launched = true;
        self.ctx.resume();
    }

    fn deinit(&mut self) {
        if self.ctx.messenger.is_connected() {
            self.ctx.flush_output();
            self.ctx.messenger.send_event("terminated", None);
            self.ctx.messenger.close();
        }
        self.remove_hook();
        self.restore_globals();
    }
}

fn on_hook(core: &Weak<RefCell<SessionCore>>, lua: &Lua, debug: &Debug) -> mlua::Result<VmState> {
    let Some(core) = core.upgrade() else {
        return Ok(VmState::Continue);
    };
    // Busy: the event comes from code the debugger itself is running.
    let Ok(mut core) = core.try_borrow_mut() else {
        return Ok(VmState::Continue);
    };
    core.on_hook(lua, debug)
}

/// A debugging session attached to one Lua state.
pub struct DebugSession {
    core: Rc<RefCell<SessionCore>>,
}

impl DebugSession {
    /// Attaches to `lua` and installs the trace hook. No protocol traffic is
    /// processed until [`DebugSession::init`].
    ///
    /// `lua` must have the `debug` library loaded (see
    /// [`crate::runtime::debug_lua`]).
    pub fn connect<T>(lua: &Lua, transport: T, options: SessionOptions) -> DebugResult<Self>
    where
        T: Transport + 'static,
    {
        let mut introspection = Introspection::capture(lua)?;
        introspection.calibrate(lua)?;

        let globals = lua.globals();
        let mut default_globals: BTreeSet<String> = BTreeSet::new();
        for pair in globals.pairs::<Value, Value>() {
            if let (Value::String(name), _) = pair? {
                default_globals.insert(name.to_string_lossy().into());
            }
        }
        let mut protected_calls = HashSet::new();
        for name in PROTECTED_CALLS {
            if let Some(id) = FunctionId::of(&globals.get::<Value>(*name)?) {
                protected_calls.insert(id);
            }
        }
        let mut yield_functions = HashSet::new();
        if let Value::Table(coroutine) = globals.get::<Value>("coroutine")? {
            if let Some(id) = FunctionId::of(&coroutine.get::<Value>("yield")?) {
                yield_functions.insert(id);
            }
        }
        let tostring: Function = globals.get("tostring")?;
        let original_print: Value = globals.get("print")?;
        let original_error: Value = globals.get("error")?;
        let redirect = options.redirect_print;

        let mut ctx = SessionContext::new(
            Messenger::new(Box::new(transport)),
            lua.clone(),
            introspection,
            options,
        );
        ctx.default_globals = default_globals;
        ctx.protected_calls = protected_calls;
        ctx.yield_functions = yield_functions;
        let output = ctx.output.clone();
        let core = Rc::new(RefCell::new(SessionCore::new(ctx)));

        let weak = Rc::downgrade(&core);
        let intercept = install_error_interceptor(lua, move |message, level| {
            let core = weak.upgrade()?;
            let mut core = core.try_borrow_mut().ok()?;
            record_error(&mut core.ctx, message, level)
        })?;
        {
            let mut core = core.borrow_mut();
            core.ctx.intercept_function = Some(intercept);
            core.replaced.push(ReplacedGlobal {
                name: "error",
                original: original_error,
                installed: globals.get("error")?,
            });
        }

        if redirect {
            redirect_print(lua, tostring, output)?;
            core.borrow_mut().replaced.push(ReplacedGlobal {
                name: "print",
                original: original_print,
                installed: globals.get("print")?,
            });
        }

        let weak = Rc::downgrade(&core);
        lua.set_hook(
            HookTriggers::new().on_calls().on_returns().every_line(),
            move |lua, debug| on_hook(&weak, lua, &debug),
        );
        core.borrow_mut().hooked = true;
        tracing::info!(target: "lua_dap.session", "debug session connected");

        Ok(Self { core })
    }

    fn core(&self) -> DebugResult<std::cell::RefMut<'_, SessionCore>> {
        self.core
            .try_borrow_mut()
            .map_err(|_| DebugError::Internal("session is busy".to_owned()))
    }

    /// Serves the configuration phase until the client launches and finishes
    /// configuration. `Err(Disconnected)` if the client goes away first.
    pub fn init(&self) -> DebugResult<()> {
        let mut core = self.core()?;
        while !core.ctx.is_running() {
            if !core.pump_one() {
                return Err(DebugError::Disconnected);
            }
        }
        tracing::info!(target: "lua_dap.session", "configuration done; running script");
        Ok(())
    }

    /// Reports an error the script did not catch and that never went through
    /// `error` (or was raised before the session could see it), then ends the
    /// session once the client resumes.
    pub fn report_fatal_error(&self, err: &mlua::Error) {
        let Ok(mut core) = self.core() else {
            return;
        };
        let state = &core.ctx.state;
        if state.abort
            || state.no_debug
            || !state.exception_filters.uncaught
            || !core.ctx.messenger.is_connected()
        {
            return;
        }
        core.ctx.state.frames_live = false;
        core.ctx.flush_output();
        report_exception(&mut core.ctx, error_message(err), false);
        core.suspend();
    }

    /// Treats `function` like `pcall` when an error unwinds into it.
    pub fn register_protected_call(&self, function: &Function) -> DebugResult<()> {
        let id = FunctionId::of(&Value::Function(function.clone()))
            .ok_or_else(|| DebugError::Internal("function has no identity".to_owned()))?;
        self.core()?.ctx.protected_calls.insert(id);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.core
            .try_borrow()
            .map(|core| core.ctx.messenger.is_connected())
            .unwrap_or(true)
    }

    /// Whether the client ended the script with `terminate`.
    pub fn was_terminated(&self) -> bool {
        self.core
            .try_borrow()
            .map(|core| core.ctx.state.abort)
            .unwrap_or(false)
    }

    /// Sends `terminated`, removes the hook and closes the transport. Idempotent.
    pub fn deinit(&self) {
        if let Ok(mut core) = self.core() {
            core.deinit();
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.deinit();
    }
}
