//! Line breakpoints: resolution to executable lines and the per-line stop check.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::{SessionContext, StopInfo, StopReason};
use crate::dap::messages::Request;
use crate::dap::types::{Breakpoint, Source};
use crate::error::{DebugError, DebugResult};
use crate::handler::DebugHandler;
use crate::handles::IdAllocator;
use crate::source_map::normalize_path;
use crate::trace::TraceEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBreakpoint {
    pub requested_line: u32,
    /// `None` when no code follows the requested line.
    pub resolved_line: Option<u32>,
}

/// Opening long bracket at the start of `text` (`[[`, `[=[`, ...), as its level.
fn long_bracket_level(text: &str) -> Option<usize> {
    let rest = text.strip_prefix('[')?;
    let level = rest.bytes().take_while(|&b| b == b'=').count();
    rest[level..].starts_with('[').then_some(level)
}

fn closing_bracket(level: usize) -> String {
    format!("]{}]", "=".repeat(level))
}

/// Byte offset of the first `--` outside a short string literal.
fn comment_start(code: &str) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'-' && bytes.get(i + 1) == Some(&b'-') => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

/// 1-based numbers of the lines that hold something other than comments and whitespace.
pub fn collect_code_lines(text: &str) -> Vec<u32> {
    let mut code_lines = Vec::new();
    // Level of the block comment we are inside, if any.
    let mut in_comment: Option<usize> = None;

    for (index, line) in text.lines().enumerate() {
        let mut rest = line;
        let mut has_code = false;
        loop {
            if let Some(level) = in_comment {
                let close = closing_bracket(level);
                match rest.find(&close) {
                    Some(pos) => {
                        rest = &rest[pos + close.len()..];
                        in_comment = None;
                        continue;
                    }
                    None => break,
                }
            }

            let trimmed = rest.trim_start();
            if trimmed.is_empty() {
                break;
            }

            let comment = comment_start(trimmed);
            if comment != Some(0) {
                has_code = true;
            }
            let Some(start) = comment else { break };
            let after = &trimmed[start + 2..];
            match long_bracket_level(after) {
                Some(level) => {
                    in_comment = Some(level);
                    rest = &after[level + 2..];
                }
                None => break,
            }
        }
        if has_code {
            code_lines.push(index as u32 + 1);
        }
    }
    code_lines
}

/// Moves each requested line forward to the first code line at or after it.
pub fn map_line_breakpoints(text: &str, requested_lines: &[u32]) -> Vec<ResolvedBreakpoint> {
    let code_lines = collect_code_lines(text);
    requested_lines
        .iter()
        .map(|&requested_line| {
            let idx = code_lines.partition_point(|&line| line < requested_line);
            ResolvedBreakpoint {
                requested_line,
                resolved_line: code_lines.get(idx).copied(),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct SourceBreakpoint {
    line: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointsArguments {
    source: Source,
    #[serde(default)]
    breakpoints: Option<Vec<SourceBreakpoint>>,
    #[serde(default)]
    lines: Option<Vec<i64>>,
}

/// Verified breakpoints keyed by normalized installed path, then line.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    ids: IdAllocator,
    files: HashMap<String, BTreeMap<u32, Vec<i64>>>,
}

impl BreakpointManager {
    pub fn hits(&self, source: &str, line: u32) -> Option<&[i64]> {
        self.files
            .get(&normalize_path(source))?
            .get(&line)
            .map(Vec::as_slice)
    }

    fn set_breakpoints(&mut self, ctx: &SessionContext, request: &Request) -> DebugResult<Value> {
        let args: SetBreakpointsArguments = request.parse_arguments()?;
        let client_path = args.source.path.clone().ok_or_else(|| DebugError::InvalidArguments {
            command: request.command.clone(),
            message: "source.path is required".to_owned(),
        })?;
        let installed = ctx
            .options
            .source_map
            .to_installed(&client_path)
            .ok_or_else(|| DebugError::InvalidSource(client_path.clone()))?;

        let requested: Vec<u32> = match (args.breakpoints, args.lines) {
            (Some(breakpoints), _) => breakpoints.iter().map(|bp| bp.line).collect(),
            (None, Some(lines)) => lines,
            (None, None) => Vec::new(),
        }
        .into_iter()
        .map(|line| line.clamp(1, i64::from(u32::MAX)) as u32)
        .collect();

        let mut lines: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
        let mut breakpoints = Vec::with_capacity(requested.len());
        match std::fs::read_to_string(&installed) {
            Ok(text) => {
                for resolved in map_line_breakpoints(&text, &requested) {
                    let breakpoint = match resolved.resolved_line {
                        Some(line) => {
                            let id = self.ids.next_id();
                            lines.entry(line).or_default().push(id);
                            Breakpoint {
                                id: Some(id),
                                verified: true,
                                line: Some(i64::from(line)),
                                message: None,
                                source: Some(args.source.clone()),
                            }
                        }
                        None => Breakpoint {
                            id: None,
                            verified: false,
                            line: Some(i64::from(resolved.requested_line)),
                            message: Some("no executable code at or after this line".to_owned()),
                            source: None,
                        },
                    };
                    breakpoints.push(breakpoint);
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "lua_dap.breakpoints",
                    path = %installed,
                    error = %err,
                    "cannot read breakpoint source"
                );
                for line in &requested {
                    breakpoints.push(Breakpoint {
                        id: None,
                        verified: false,
                        line: Some(i64::from(*line)),
                        message: Some(format!("cannot read {installed}")),
                        source: None,
                    });
                }
            }
        }

        tracing::debug!(
            target: "lua_dap.breakpoints",
            path = %installed,
            verified = lines.values().map(Vec::len).sum::<usize>(),
            "breakpoints replaced"
        );
        let key = normalize_path(&installed);
        if lines.is_empty() {
            self.files.remove(&key);
        } else {
            self.files.insert(key, lines);
        }

        Ok(json!({ "breakpoints": breakpoints }))
    }
}

impl DebugHandler for BreakpointManager {
    fn commands(&self) -> &'static [&'static str] {
        &["setBreakpoints"]
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<Value>> {
        self.set_breakpoints(ctx, request).map(Some)
    }

    fn on_trace(&mut self, ctx: &mut SessionContext, event: &TraceEvent) -> DebugResult<()> {
        let TraceEvent::Line(line) = event else {
            return Ok(());
        };
        if ctx.state.no_debug || self.files.is_empty() {
            return Ok(());
        }
        let Some(frame) = ctx.stack.top() else {
            return Ok(());
        };
        if let Some(ids) = self.hits(&frame.source, *line) {
            let mut stop = StopInfo::new(StopReason::Breakpoint);
            stop.hit_breakpoint_ids = ids.to_vec();
            ctx.request_stop(stop);
        }
        Ok(())
    }
}
