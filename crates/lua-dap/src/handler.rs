use serde_json::Value;

use crate::context::SessionContext;
use crate::dap::messages::Request;
use crate::error::DebugResult;
use crate::trace::TraceEvent;

/// A component the session routes requests and trace events to.
///
/// The session owns handlers in a fixed order; trace events reach them in that
/// order, so later handlers see the shadow stack already updated.
pub trait DebugHandler {
    /// Commands this handler answers.
    fn commands(&self) -> &'static [&'static str];

    /// Produces the response body. Errors become error responses.
    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<Value>>;

    fn on_trace(&mut self, _ctx: &mut SessionContext, _event: &TraceEvent) -> DebugResult<()> {
        Ok(())
    }

    /// Called once the `stopped` event is out, before any request of the stop.
    fn on_stop(&mut self, _ctx: &mut SessionContext) {}

    /// Called when execution resumes. Per-stop state must be released here.
    fn on_continue(&mut self, _ctx: &mut SessionContext) {}
}
