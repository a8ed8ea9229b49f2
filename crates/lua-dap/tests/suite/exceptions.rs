use serde_json::json;

use crate::harness::{names, DebugTarget};

const UNCAUGHT: &str = "\
local function explode()
  error(\"kaboom\")
end
explode()
";

const CAUGHT: &str = "\
local ok, err = pcall(function()
  error(\"handled\")
end)
print(ok, err)
";

#[test]
fn uncaught_error_stops_then_ends_the_session() {
    let mut target = DebugTarget::spawn(UNCAUGHT);
    target.start(&[]);
    let message = format!("{}:2: kaboom", target.path());

    let stop = target.stopped();
    assert_eq!(stop["reason"], "exception");
    assert_eq!(stop["description"], message.as_str());

    let info = target.call("exceptionInfo", json!({ "threadId": 1 }));
    assert_eq!(info["breakMode"], "unhandled");
    assert_eq!(info["description"], message.as_str());
    assert_eq!(info["details"]["message"], message.as_str());

    let frames = target.stack_frames();
    assert_eq!(frames[0]["name"], "explode");
    assert_eq!(frames[0]["line"], 2);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 4);

    target.continue_();
    target.run_to_end();
    target.assert_closed();

    let outcome = target.finish();
    assert!(outcome.unwrap_err().contains("kaboom"));
}

#[test]
fn caught_errors_do_not_stop_by_default() {
    let mut target = DebugTarget::spawn(CAUGHT);
    target.start(&[]);
    let expected = format!("false\t{}:2: handled\n", target.path());
    assert_eq!(target.run_to_end(), expected);
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn caught_filter_stops_on_protected_errors() {
    let mut target = DebugTarget::spawn(CAUGHT);
    target.initialize();
    target.call("launch", json!({}));
    let body = target.call(
        "setExceptionBreakpoints",
        json!({ "filters": ["uncaught", "caught"] }),
    );
    assert_eq!(
        body["breakpoints"],
        json!([{ "verified": true }, { "verified": true }])
    );
    target.call("configurationDone", json!({}));

    let stop = target.stopped();
    assert_eq!(stop["reason"], "exception");
    let info = target.call("exceptionInfo", json!({ "threadId": 1 }));
    assert_eq!(info["breakMode"], "always");
    assert_eq!(
        info["description"],
        format!("{}:2: handled", target.path()).as_str()
    );

    // The script keeps running once the client resumes.
    target.continue_();
    let expected = format!("false\t{}:2: handled\n", target.path());
    assert_eq!(target.run_to_end(), expected);
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn clearing_the_filters_lets_errors_through() {
    let mut target = DebugTarget::spawn(UNCAUGHT);
    target.initialize();
    target.call("launch", json!({}));
    target.call("setExceptionBreakpoints", json!({ "filters": [] }));
    target.call("configurationDone", json!({}));

    target.run_to_end();
    assert!(target.finish().unwrap_err().contains("kaboom"));
}

#[test]
fn runtime_errors_stop_with_only_globals_left() {
    let mut target = DebugTarget::spawn(
        "local function broken()\n\
         local t = nil\n\
         return t.x\n\
         end\n\
         broken()\n",
    );
    target.start(&[]);

    let stop = target.stopped();
    assert_eq!(stop["reason"], "exception");
    let description = stop["description"].as_str().unwrap();
    assert!(
        description.contains(":3: attempt to index a nil value"),
        "{description}"
    );

    let scopes = target.scopes(&json!(0));
    assert_eq!(names(&scopes), ["Globals", "Globals (default)"]);

    target.continue_();
    target.run_to_end();
    target.assert_closed();
    assert!(target.finish().is_err());
}

#[test]
fn tail_called_error_keeps_its_message_and_frames() {
    let mut target = DebugTarget::spawn(
        "local function explode()\n\
         local reason = \"kaboom\"\n\
         return error(reason)\n\
         end\n\
         explode()\n",
    );
    target.start(&[]);
    let message = format!("{}:3: kaboom", target.path());

    let stop = target.stopped();
    assert_eq!(stop["reason"], "exception");
    assert_eq!(stop["description"], message.as_str());

    let frames = target.stack_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["name"], "explode");
    assert_eq!(frames[0]["line"], 3);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 5);

    // `explode`'s activation was reused by the tail call: nothing of another
    // frame shows up in its place.
    let scopes = target.scopes(&frames[0]["id"]);
    assert_eq!(names(&scopes), ["Globals", "Globals (default)"]);
    let reason = target.call(
        "evaluate",
        json!({ "expression": "reason", "frameId": frames[0]["id"] }),
    );
    assert_eq!(reason["result"], "nil");

    let reference = target.scope_reference(&frames[1]["id"], "Locals");
    assert_eq!(names(&target.variables(reference)), ["explode"]);

    target.continue_();
    target.run_to_end();
    target.assert_closed();
    assert_eq!(target.finish(), Err(message));
}
