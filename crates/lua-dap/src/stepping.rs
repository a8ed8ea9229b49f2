//! Execution control: `continue`, the three step requests and `pause`.

use serde_json::{json, Value};

use crate::context::{SessionContext, StopInfo, StopReason};
use crate::dap::messages::Request;
use crate::error::{DebugError, DebugResult};
use crate::handler::DebugHandler;
use crate::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    Idle,
    /// Stop at the next line event, wherever it is.
    StepIn,
    /// Stop at the first line event with the shadow stack at most this deep.
    StepOut(usize),
}

#[derive(Debug, Default)]
pub struct StepController {
    mode: StepMode,
}

impl StepController {
    fn arm(&mut self, ctx: &mut SessionContext, mode: StepMode) {
        tracing::debug!(target: "lua_dap.step", ?mode, depth = ctx.stack.depth(), "step armed");
        self.mode = mode;
        ctx.resume();
    }

    /// Whether a line event at `depth` ends the armed step.
    fn should_stop(&self, depth: usize) -> bool {
        match self.mode {
            StepMode::Idle => false,
            StepMode::StepIn => true,
            StepMode::StepOut(target) => depth <= target,
        }
    }
}

impl DebugHandler for StepController {
    fn commands(&self) -> &'static [&'static str] {
        &["continue", "next", "stepIn", "stepOut", "pause"]
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<Value>> {
        let depth = ctx.stack.depth();
        match request.command.as_str() {
            "continue" => {
                self.arm(ctx, StepMode::Idle);
                return Ok(Some(json!({ "allThreadsContinued": true })));
            }
            "next" => self.arm(ctx, StepMode::StepOut(depth)),
            "stepIn" => self.arm(ctx, StepMode::StepIn),
            "stepOut" => self.arm(ctx, StepMode::StepOut(depth.saturating_sub(1))),
            "pause" => {
                // Already suspended: nothing to do.
                if ctx.is_running() && !ctx.state.no_debug {
                    ctx.request_stop(StopInfo::new(StopReason::Pause));
                }
            }
            other => return Err(DebugError::NotImplemented(other.to_owned())),
        }
        Ok(None)
    }

    fn on_trace(&mut self, ctx: &mut SessionContext, event: &TraceEvent) -> DebugResult<()> {
        if !event.is_line() || ctx.state.no_debug {
            return Ok(());
        }
        if ctx.state.stop_on_entry {
            ctx.state.stop_on_entry = false;
            ctx.request_stop(StopInfo::new(StopReason::Entry));
            return Ok(());
        }
        if self.should_stop(ctx.stack.depth()) {
            ctx.request_stop(StopInfo::new(StopReason::Step));
        }
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut SessionContext) {
        self.mode = StepMode::Idle;
    }
}
