//! State shared by the session controller and every handler.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::rc::Rc;

use mlua::Lua;
use serde_json::{json, Value};

use crate::dap::messages::{Event, Request, Response};
use crate::error::{DebugError, DebugResult};
use crate::handles::IdAllocator;
use crate::introspection::Introspection;
use crate::output::OutputBuffer;
use crate::source_map::SourceMap;
use crate::stack::ShadowStack;
use crate::trace::{FunctionId, ThreadId};
use crate::transport::Transport;

/// The only thread the adapter reports.
pub const THREAD_ID: i64 = 1;

/// Owns the transport and the adapter-side sequence counter.
pub struct Messenger {
    transport: Box<dyn Transport>,
    seq: IdAllocator,
    last_client_seq: Option<i64>,
}

impl Messenger {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            seq: IdAllocator::starting_at(1),
            last_client_seq: None,
        }
    }

    fn send(&mut self, message: Value) {
        if !self.transport.is_connected() {
            return;
        }
        if let Err(err) = self.transport.send(&message) {
            tracing::debug!(target: "lua_dap.session", error = %err, "failed to send message");
        }
    }

    pub fn send_response(&mut self, request: &Request, body: Option<Value>) {
        let response = Response::success(self.seq.next_id(), request, body);
        self.send(json!(response));
    }

    /// `request` is `None` for failures not tied to a decodable request.
    pub fn send_error(&mut self, request: Option<&Request>, err: &DebugError) {
        let response = Response::from_debug_error(self.seq.next_id(), request, err);
        self.send(json!(response));
    }

    pub fn send_event(&mut self, event: &str, body: Option<Value>) {
        let event = Event::new(self.seq.next_id(), event, body);
        self.send(json!(event));
    }

    pub fn receive(&mut self) -> DebugResult<Option<Value>> {
        self.transport.receive()
    }

    pub fn has_pending_message(&mut self) -> bool {
        self.transport.has_pending_message()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Client seqs should increase; a regression is only worth a log line.
    pub fn observe_client_seq(&mut self, seq: i64) {
        if let Some(last) = self.last_client_seq {
            if seq <= last {
                tracing::warn!(
                    target: "lua_dap.session",
                    seq,
                    last,
                    "client sequence number did not increase"
                );
            }
        }
        self.last_client_seq = Some(seq);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Breakpoint,
    Step,
    Pause,
    Exception,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
            StopReason::Exception => "exception",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub reason: StopReason,
    pub description: Option<String>,
    pub hit_breakpoint_ids: Vec<i64>,
}

impl StopInfo {
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            description: None,
            hit_breakpoint_ids: Vec::new(),
        }
    }

    pub fn body(&self) -> Value {
        let mut body = json!({
            "reason": self.reason.as_str(),
            "threadId": THREAD_ID,
            "allThreadsStopped": true,
        });
        if let Some(description) = &self.description {
            body["description"] = json!(description);
            body["text"] = json!(description);
        }
        if !self.hit_breakpoint_ids.is_empty() {
            body["hitBreakpointIds"] = json!(self.hit_breakpoint_ids);
        }
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFilters {
    pub uncaught: bool,
    pub caught: bool,
}

impl Default for ExceptionFilters {
    fn default() -> Self {
        Self {
            uncaught: true,
            caught: false,
        }
    }
}

/// An error seen by the `error` interceptor, waiting for the next trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingError {
    pub message: String,
    pub target_depth: usize,
    /// A protected call on the stack will catch it.
    pub caught: bool,
    /// `error` was tail-called, so its wrapper took over the raising
    /// function's runtime frame.
    pub raiser_replaced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub message: String,
    pub caught: bool,
}

/// Work to do once the response to the current request has been sent.
#[derive(Debug, Clone, PartialEq)]
pub enum PostAction {
    Event(&'static str, Option<Value>),
    Detach,
    Terminate,
}

#[derive(Debug)]
pub struct SessionState {
    pub stopped: bool,
    pub launched: bool,
    pub stop: Option<StopInfo>,
    pub stop_on_entry: bool,
    pub no_debug: bool,
    /// Tear down once the client resumes.
    pub terminate_after_resume: bool,
    /// Raise an error out of the trace callback to end the script.
    pub abort: bool,
    /// `false` once the runtime has unwound past the frames on the shadow stack.
    pub frames_live: bool,
    pub exception_filters: ExceptionFilters,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            // Nothing runs before `configurationDone`.
            stopped: true,
            launched: false,
            stop: None,
            stop_on_entry: false,
            no_debug: false,
            terminate_after_resume: false,
            abort: false,
            frames_live: true,
            exception_filters: ExceptionFilters::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub source_map: SourceMap,
    pub stack_trace_updates: bool,
    pub redirect_print: bool,
    /// Stop on the first line even when `launch` does not ask for it.
    pub stop_on_entry: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            source_map: SourceMap::identity(),
            stack_trace_updates: true,
            redirect_print: true,
            stop_on_entry: false,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &lua_dap_config::LuaDapConfig) -> Self {
        Self {
            source_map: SourceMap::new(
                config.installed_root.as_deref(),
                config.source_root.as_deref(),
            ),
            stack_trace_updates: config.stack_trace_updates,
            redirect_print: config.redirect_print,
            stop_on_entry: false,
        }
    }
}

pub struct SessionContext {
    pub messenger: Messenger,
    pub lua: Lua,
    pub introspection: Introspection,
    pub options: SessionOptions,
    pub state: SessionState,
    pub stack: ShadowStack,
    /// Runtime frames above the top of the shadow stack at the current event.
    pub frame_bias: usize,
    /// Visible frames, from the top, whose runtime activation is gone.
    pub vanished_frames: usize,
    pub current_thread: ThreadId,
    pub protected_calls: HashSet<FunctionId>,
    pub yield_functions: HashSet<FunctionId>,
    /// Global names present when the session connected.
    pub default_globals: BTreeSet<String>,
    pub intercept_function: Option<FunctionId>,
    pub pending_error: Option<PendingError>,
    pub exception: Option<ExceptionRecord>,
    pub output: Rc<RefCell<OutputBuffer>>,
    pub post_actions: Vec<PostAction>,
}

impl SessionContext {
    pub fn new(
        messenger: Messenger,
        lua: Lua,
        introspection: Introspection,
        options: SessionOptions,
    ) -> Self {
        Self {
            messenger,
            lua,
            introspection,
            options,
            state: SessionState::default(),
            stack: ShadowStack::default(),
            frame_bias: 0,
            vanished_frames: 0,
            current_thread: ThreadId::default(),
            protected_calls: HashSet::new(),
            yield_functions: HashSet::new(),
            default_globals: BTreeSet::new(),
            intercept_function: None,
            pending_error: None,
            exception: None,
            output: Rc::new(RefCell::new(OutputBuffer::default())),
            post_actions: Vec::new(),
        }
    }

    /// Suspends at the end of the current event. The first request wins.
    pub fn request_stop(&mut self, stop: StopInfo) {
        if self.state.stop.is_some() {
            return;
        }
        tracing::debug!(target: "lua_dap.session", reason = stop.reason.as_str(), "stop requested");
        self.state.stop = Some(stop);
        self.state.stopped = true;
    }

    pub fn resume(&mut self) {
        self.state.stopped = false;
    }

    pub fn is_running(&self) -> bool {
        self.state.launched && !self.state.stopped
    }

    /// Runtime level (relative to the hooked function) of a visible frame id.
    ///
    /// `None` for frames the runtime cannot address from here: activations
    /// that were replaced, and frames of a thread other than the running one.
    pub fn runtime_level(&self, frame_id: usize) -> Option<usize> {
        if frame_id < self.vanished_frames {
            return None;
        }
        let visible = self.stack.visible_frames();
        let frame = visible.get(frame_id)?;
        (frame.frame.thread == self.stack.current_thread()).then_some(self.frame_bias + frame_id)
    }

    pub fn after_response(&mut self, action: PostAction) {
        self.post_actions.push(action);
    }

    pub fn flush_output(&mut self) {
        let text = self.output.borrow_mut().take();
        if let Some(text) = text {
            self.messenger.send_event(
                "output",
                Some(json!({ "category": "stdout", "output": text })),
            );
        }
    }

    pub fn emit_stack_update(&mut self, body: Value) {
        if self.options.stack_trace_updates {
            self.messenger.send_event("stackTraceUpdate", Some(body));
        }
    }

    /// Logs a shadow-stack inconsistency and shows it on the client console.
    pub fn report_inconsistency(&mut self, message: &str) {
        tracing::warn!(target: "lua_dap.stack", "{message}");
        self.messenger.send_event(
            "output",
            Some(json!({
                "category": "console",
                "output": format!("lua-dap: {message}\n"),
            })),
        );
    }
}
