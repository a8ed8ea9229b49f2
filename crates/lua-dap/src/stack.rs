//! Shadow call stack, rebuilt from trace events, and the `stackTrace` /
//! `source` requests it answers.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::SessionContext;
use crate::dap::messages::Request;
use crate::dap::types::{Source, StackFrame as DapStackFrame};
use crate::error::{DebugError, DebugResult};
use crate::handler::DebugHandler;
use crate::handles::IdAllocator;
use crate::trace::{FrameInfo, FrameKind, FunctionId, ThreadId, TraceEvent};

/// Name of the outermost frame when the runtime has none.
pub const MAIN_FRAME_NAME: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub name: String,
    pub source: String,
    pub line: u32,
    pub kind: FrameKind,
    pub is_tail_call: bool,
    pub function: Option<FunctionId>,
    pub thread: ThreadId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// The top frame (and the tail calls above it) returned.
    Returned { popped: usize },
    /// An error unwound into a protected call, which then returned.
    Unwound { popped: usize },
    /// Nothing on the stack explains the return.
    Inconsistent { popped: usize },
}

impl ReturnOutcome {
    pub fn popped(self) -> usize {
        match self {
            ReturnOutcome::Returned { popped }
            | ReturnOutcome::Unwound { popped }
            | ReturnOutcome::Inconsistent { popped } => popped,
        }
    }
}

/// Control moved to another coroutine between two events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSwitch {
    /// Back in a resumer: the coroutines above it yielded (`parked` frames
    /// kept for their next resume) or died (`dropped`).
    Left { parked: usize, dropped: usize },
    /// Into a coroutine, with the frames it had when it last yielded.
    Entered { restored: usize },
}

/// A frame as the client sees it: tail-call runs fold into one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleFrame<'a> {
    pub id: usize,
    pub frame: &'a StackFrame,
}

/// Top of the stack is the last element.
///
/// Frames of a coroutine sit above the frames of whoever resumed it; a
/// suspended coroutine's frames are parked until it is resumed again.
#[derive(Debug, Default)]
pub struct ShadowStack {
    frames: Vec<StackFrame>,
    current: ThreadId,
    parked: HashMap<ThreadId, Vec<StackFrame>>,
}

fn short_source(source: &str) -> &str {
    let source = source
        .strip_prefix('@')
        .or_else(|| source.strip_prefix('='))
        .unwrap_or(source);
    source.rsplit(['/', '\\']).next().unwrap_or(source)
}

impl ShadowStack {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn push(&mut self, info: FrameInfo, is_tail_call: bool) -> &StackFrame {
        let name = match info.name {
            Some(name) => name,
            None if self.frames.is_empty() || info.kind == FrameKind::Main => {
                MAIN_FRAME_NAME.to_owned()
            }
            None if info.kind == FrameKind::Native => "[C]".to_owned(),
            None => format!(
                "function <{}:{}>",
                short_source(&info.source),
                info.line_defined
            ),
        };
        self.frames.push(StackFrame {
            name,
            source: info.source,
            line: info.line,
            kind: info.kind,
            is_tail_call,
            function: info.function,
            thread: self.current,
        });
        &self.frames[self.frames.len() - 1]
    }

    pub fn update_line(&mut self, line: u32) -> bool {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.line = line;
                true
            }
            None => false,
        }
    }

    /// Pops the trailing run of tail-call frames plus the frame that started it.
    pub fn pop_frame(&mut self) -> usize {
        let mut popped = 0;
        while self.frames.last().is_some_and(|frame| frame.is_tail_call) {
            self.frames.pop();
            popped += 1;
        }
        if self.frames.pop().is_some() {
            popped += 1;
        }
        popped
    }

    /// Applies a return event.
    ///
    /// `active` is the returning function; `protected` lists the primitives an
    /// error may unwind into without firing the intermediate returns.
    pub fn on_return(
        &mut self,
        active: Option<FunctionId>,
        protected: &HashSet<FunctionId>,
    ) -> ReturnOutcome {
        let Some(top) = self.frames.last() else {
            return ReturnOutcome::Inconsistent { popped: 0 };
        };

        let matches_top = match (active, top.function) {
            (Some(active), Some(expected)) => active == expected,
            _ => true,
        };
        if matches_top {
            return ReturnOutcome::Returned {
                popped: self.pop_frame(),
            };
        }

        if let Some(active) = active.filter(|active| protected.contains(active)) {
            if self.frames.iter().any(|frame| frame.function == Some(active)) {
                let mut popped = 0;
                while self.top().is_some_and(|frame| frame.function != Some(active)) {
                    self.frames.pop();
                    popped += 1;
                }
                popped += self.pop_frame();
                return ReturnOutcome::Unwound { popped };
            }
        }

        ReturnOutcome::Inconsistent {
            popped: self.pop_frame(),
        }
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    /// Whether the running thread was resumed by another one.
    pub fn in_coroutine(&self) -> bool {
        self.frames
            .first()
            .is_some_and(|frame| frame.thread != self.current)
    }

    /// Follows the runtime to `thread` before applying its next event.
    ///
    /// `resumed` tells whether that event is a return: a suspended coroutine
    /// picks up again with the return of the yield that suspended it, while
    /// a fresh one starts with a call. Coroutines whose top frame is not one
    /// of `yields` when control leaves them are dead and are forgotten.
    pub fn switch_to(
        &mut self,
        thread: ThreadId,
        resumed: bool,
        yields: &HashSet<FunctionId>,
    ) -> Option<ThreadSwitch> {
        if thread == self.current {
            return None;
        }
        self.current = thread;
        if self.frames.is_empty() {
            return None;
        }

        if let Some(base) = self.frames.iter().rposition(|frame| frame.thread == thread) {
            let above = self.frames.split_off(base + 1);
            if above.is_empty() {
                return None;
            }
            let mut suspended: Vec<(ThreadId, Vec<StackFrame>)> = Vec::new();
            for frame in above {
                match suspended.last_mut() {
                    Some((owner, frames)) if *owner == frame.thread => frames.push(frame),
                    _ => suspended.push((frame.thread, vec![frame])),
                }
            }
            let (mut parked, mut dropped) = (0, 0);
            for (owner, frames) in suspended {
                let yielded = frames
                    .last()
                    .and_then(|frame| frame.function)
                    .is_some_and(|function| yields.contains(&function));
                if yielded {
                    parked += frames.len();
                    self.parked.insert(owner, frames);
                } else {
                    dropped += frames.len();
                    self.parked.remove(&owner);
                }
            }
            return Some(ThreadSwitch::Left { parked, dropped });
        }

        let restored = match self.parked.remove(&thread) {
            Some(frames) if resumed => {
                let restored = frames.len();
                self.frames.extend(frames);
                restored
            }
            _ => 0,
        };
        Some(ThreadSwitch::Entered { restored })
    }

    /// Pops down to `depth` frames, returning how many were removed.
    pub fn truncate(&mut self, depth: usize) -> usize {
        let popped = self.frames.len().saturating_sub(depth);
        self.frames.truncate(depth);
        popped
    }

    pub fn contains_any(&self, functions: &HashSet<FunctionId>) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.function.is_some_and(|id| functions.contains(&id)))
    }

    /// Frames top first, with each tail-call run folded into the frame that
    /// started it and shown as its most recent member. Ids are contiguous.
    pub fn visible_frames(&self) -> Vec<VisibleFrame<'_>> {
        self.visible_frames_below(self.frames.len())
    }

    /// [`ShadowStack::visible_frames`] of the bottom `depth` frames only.
    pub fn visible_frames_below(&self, depth: usize) -> Vec<VisibleFrame<'_>> {
        let frames = &self.frames[..depth.min(self.frames.len())];
        let mut out = Vec::new();
        let mut skipped = 0;
        let mut run_top: Option<&StackFrame> = None;
        for (position, frame) in frames.iter().rev().enumerate() {
            let shown = run_top.take().unwrap_or(frame);
            if frame.is_tail_call {
                run_top = Some(shown);
                skipped += 1;
                continue;
            }
            out.push(VisibleFrame {
                id: position - skipped,
                frame: shown,
            });
        }
        if let Some(shown) = run_top {
            out.push(VisibleFrame {
                id: frames.len() - skipped,
                frame: shown,
            });
        }
        out
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArguments {
    #[serde(default)]
    start_frame: Option<usize>,
    #[serde(default)]
    levels: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceArguments {
    #[serde(default)]
    source: Option<Source>,
    #[serde(default)]
    source_reference: Option<i64>,
}

/// Maintains the shadow stack and answers `stackTrace` and `source`.
#[derive(Debug, Default)]
pub struct StackTraceHandler {
    source_ids: IdAllocator,
    source_refs: HashMap<String, i64>,
    sources_by_ref: HashMap<i64, String>,
}

impl StackTraceHandler {
    /// Chunks not loaded from a file are addressed by a session-long reference.
    fn source_reference(&mut self, chunk: &str) -> i64 {
        if let Some(id) = self.source_refs.get(chunk) {
            return *id;
        }
        let id = self.source_ids.next_id();
        self.source_refs.insert(chunk.to_owned(), id);
        self.sources_by_ref.insert(id, chunk.to_owned());
        id
    }

    fn dap_source(&mut self, ctx: &SessionContext, frame: &StackFrame) -> Option<Source> {
        if frame.kind == FrameKind::Native || frame.source.is_empty() || frame.source == "=[C]" {
            return None;
        }
        if let Some(path) = frame.source.strip_prefix('@') {
            let path = ctx.options.source_map.to_source(path);
            return Some(Source {
                name: Some(short_source(&path).to_owned()),
                path: Some(path),
                source_reference: None,
            });
        }
        Some(Source {
            name: Some(chunk_id(&frame.source)),
            path: None,
            source_reference: Some(self.source_reference(&frame.source)),
        })
    }

    fn stack_trace(&mut self, ctx: &SessionContext, request: &Request) -> DebugResult<Value> {
        let args: StackTraceArguments = request.parse_arguments()?;
        let visible = ctx.stack.visible_frames();
        let total = visible.len();
        let start = args.start_frame.unwrap_or(0).min(total);
        let end = match args.levels {
            Some(levels) if levels > 0 => start.saturating_add(levels).min(total),
            _ => total,
        };

        let mut frames = Vec::with_capacity(end - start);
        for visible in &visible[start..end] {
            let frame = visible.frame;
            let source = self.dap_source(ctx, frame);
            let native = frame.kind == FrameKind::Native;
            frames.push(DapStackFrame {
                id: visible.id as i64,
                name: frame.name.clone(),
                line: if native { 0 } else { i64::from(frame.line) },
                column: if native { 0 } else { 1 },
                presentation_hint: native.then_some("subtle"),
                source,
            });
        }

        Ok(json!({ "stackFrames": frames, "totalFrames": total }))
    }

    fn source(&self, request: &Request) -> DebugResult<Value> {
        let args: SourceArguments = request.parse_arguments()?;
        let reference = args
            .source
            .as_ref()
            .and_then(|source| source.source_reference)
            .or(args.source_reference)
            .unwrap_or(0);
        let chunk = self
            .sources_by_ref
            .get(&reference)
            .ok_or_else(|| DebugError::InvalidSource(format!("sourceReference {reference}")))?;

        // `=label` chunks carry no text; anything else is the chunk itself.
        let content = match chunk.strip_prefix('=') {
            Some(label) => format!("-- source not available: {label}\n"),
            None => chunk.clone(),
        };
        Ok(json!({ "content": content, "mimeType": "text/x-lua" }))
    }
}

/// Room the runtime gives a chunk id, terminator included.
const CHUNK_ID_SIZE: usize = 60;

/// How the runtime names a chunk in error messages, truncation included.
pub(crate) fn chunk_id(source: &str) -> String {
    if let Some(label) = source.strip_prefix('=') {
        return head(label, CHUNK_ID_SIZE - 1).to_owned();
    }
    if let Some(path) = source.strip_prefix('@') {
        if path.len() < CHUNK_ID_SIZE {
            return path.to_owned();
        }
        return format!("...{}", tail(path, CHUNK_ID_SIZE - 4));
    }
    let room = CHUNK_ID_SIZE - "[string \"...\"]".len() - 1;
    match source.split_once('\n') {
        None if source.len() < room => format!("[string \"{source}\"]"),
        Some((line, _)) => format!("[string \"{}...\"]", head(line, room)),
        None => format!("[string \"{}...\"]", head(source, room)),
    }
}

/// At most `len` bytes from the start of `text`, on a char boundary.
fn head(text: &str, len: usize) -> &str {
    let mut end = len.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// At most `len` bytes from the end of `text`, on a char boundary.
fn tail(text: &str, len: usize) -> &str {
    let mut start = text.len().saturating_sub(len);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn push_update(frame: &StackFrame) -> Value {
    json!({
        "action": "push",
        "name": frame.name,
        "source": frame.source,
        "line": frame.line,
        "tailCall": frame.is_tail_call,
    })
}

impl DebugHandler for StackTraceHandler {
    fn commands(&self) -> &'static [&'static str] {
        &["stackTrace", "source"]
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<Value>> {
        match request.command.as_str() {
            "stackTrace" => self.stack_trace(ctx, request).map(Some),
            "source" => self.source(request).map(Some),
            other => Err(DebugError::NotImplemented(other.to_owned())),
        }
    }

    fn on_trace(&mut self, ctx: &mut SessionContext, event: &TraceEvent) -> DebugResult<()> {
        let resumed = matches!(event, TraceEvent::Return { .. });
        match ctx
            .stack
            .switch_to(ctx.current_thread, resumed, &ctx.yield_functions)
        {
            Some(ThreadSwitch::Left { parked, dropped }) => {
                tracing::trace!(target: "lua_dap.stack", parked, dropped, "left coroutine");
                ctx.emit_stack_update(json!({
                    "action": "pop",
                    "pop_count": parked + dropped,
                }));
            }
            Some(ThreadSwitch::Entered { restored }) => {
                tracing::trace!(target: "lua_dap.stack", restored, "entered coroutine");
                let depth = ctx.stack.depth();
                let updates: Vec<Value> = ctx.stack.frames()[depth - restored..]
                    .iter()
                    .map(push_update)
                    .collect();
                for body in updates {
                    ctx.emit_stack_update(body);
                }
            }
            None => {}
        }

        match event {
            TraceEvent::Call(info) | TraceEvent::TailCall(info) => {
                let is_tail_call = matches!(event, TraceEvent::TailCall(_));
                let body = push_update(ctx.stack.push(info.clone(), is_tail_call));
                ctx.emit_stack_update(body);
            }
            TraceEvent::Line(line) => {
                if ctx.stack.update_line(*line) {
                    ctx.emit_stack_update(json!({ "action": "update_line", "line": line }));
                }
            }
            TraceEvent::Return { active } => {
                // The returning function is still on the runtime stack.
                ctx.frame_bias = 1;
                let outcome = ctx.stack.on_return(*active, &ctx.protected_calls);
                if let ReturnOutcome::Inconsistent { popped } = outcome {
                    ctx.report_inconsistency(&format!(
                        "unbalanced return event; popped {popped} frame(s), depth is now {}",
                        ctx.stack.depth()
                    ));
                }
                ctx.emit_stack_update(json!({
                    "action": "pop",
                    "pop_count": outcome.popped(),
                }));
            }
        }
        Ok(())
    }
}
