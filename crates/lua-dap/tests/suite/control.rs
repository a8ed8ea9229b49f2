use serde_json::json;

use crate::harness::DebugTarget;
use lua_dap::TERMINATED_MESSAGE;

const SPIN: &str = "\
local n = 0
while true do
  n = n + 1
end
";

#[test]
fn pause_suspends_a_running_script_and_terminate_ends_it() {
    let mut target = DebugTarget::spawn(SPIN);
    target.start(&[]);

    target.call("pause", json!({ "threadId": 1 }));
    let stop = target.stopped();
    assert_eq!(stop["reason"], "pause");

    let frame = target.top_frame();
    assert_eq!(frame["name"], "main");
    let count = target.call(
        "evaluate",
        json!({ "expression": "n", "frameId": frame["id"] }),
    );
    assert_eq!(count["type"], "integer");

    // Pausing a suspended script changes nothing.
    target.call("pause", json!({ "threadId": 1 }));

    target.call("terminate", json!({}));
    target.event("terminated");
    target.assert_closed();

    let outcome = target.finish();
    assert!(outcome.unwrap_err().contains(TERMINATED_MESSAGE));
}

#[test]
fn disconnect_with_terminate_debuggee_stops_the_script() {
    let mut target = DebugTarget::spawn(SPIN);
    target.start(&[3]);
    target.stopped();

    target.call("disconnect", json!({ "terminateDebuggee": true }));
    target.event("terminated");
    target.assert_closed();
    assert!(target.finish().unwrap_err().contains(TERMINATED_MESSAGE));
}

#[test]
fn disconnect_detaches_and_lets_the_script_finish() {
    let mut target = DebugTarget::spawn(
        "local function work()\n\
         return 21 * 2\n\
         end\n\
         answer = work()\n",
    );
    target.start(&[2]);
    target.stopped();

    target.call("disconnect", json!({}));
    target.assert_closed();
    assert_eq!(target.finish(), Ok(()));
}
