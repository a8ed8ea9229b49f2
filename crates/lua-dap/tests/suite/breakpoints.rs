use serde_json::json;

use crate::harness::{find, names, DebugTarget};

const ADD: &str = "\
config = { name = \"demo\", 10, 20 }
local function add(a, b)
  local sum = a + b
  return sum
end

-- the total
local total = add(2, 3)
print(total)
";

#[test]
fn breakpoints_resolve_to_code_lines() {
    let mut target = DebugTarget::spawn(ADD);
    let breakpoints = target.start(&[4, 6, 42]);

    assert_eq!(breakpoints.len(), 3);
    assert_eq!(breakpoints[0]["verified"], true);
    assert_eq!(breakpoints[0]["line"], 4);
    // Blank line and comment move forward to the call.
    assert_eq!(breakpoints[1]["verified"], true);
    assert_eq!(breakpoints[1]["line"], 8);
    assert!(breakpoints[1]["id"].as_i64() > breakpoints[0]["id"].as_i64());
    assert_eq!(breakpoints[2]["verified"], false);
    assert!(breakpoints[2].get("id").is_none());

    let stop = target.stopped();
    assert_eq!(stop["reason"], "breakpoint");
    assert_eq!(stop["threadId"], 1);
    assert_eq!(stop["hitBreakpointIds"], json!([breakpoints[1]["id"]]));

    let frames = target.stack_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["name"], "main");
    assert_eq!(frames[0]["line"], 8);
    assert_eq!(frames[0]["source"]["path"], target.path());

    target.continue_();
    let stop = target.stopped();
    assert_eq!(stop["hitBreakpointIds"], json!([breakpoints[0]["id"]]));

    let body = target.call("stackTrace", json!({ "threadId": 1 }));
    assert_eq!(body["totalFrames"], 2);
    let frames = body["stackFrames"].as_array().unwrap();
    assert_eq!(frames[0]["name"], "add");
    assert_eq!(frames[0]["line"], 4);
    assert_eq!(frames[1]["name"], "main");
    assert_eq!(frames[1]["line"], 8);

    target.continue_();
    assert_eq!(target.run_to_end(), "5\n");
    target.assert_closed();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn frame_scopes_list_arguments_locals_and_globals() {
    let mut target = DebugTarget::spawn(ADD);
    target.start(&[4]);
    target.stopped();

    let frame = target.top_frame();
    let scopes = target.scopes(&frame["id"]);
    assert_eq!(
        names(&scopes),
        [
            "Locals",
            "Arguments",
            "Upvalues",
            "Globals",
            "Globals (default)",
            "Temporaries"
        ]
    );
    assert_eq!(scopes[4]["expensive"], true);
    assert_eq!(scopes[0]["presentationHint"], "locals");

    let arguments = target.variables(scopes[1]["variablesReference"].as_i64().unwrap());
    assert_eq!(names(&arguments), ["a", "b"]);
    assert_eq!(arguments[0]["value"], "2");
    assert_eq!(arguments[0]["type"], "integer");
    assert_eq!(arguments[0]["variablesReference"], 0);

    let locals = target.variables(scopes[0]["variablesReference"].as_i64().unwrap());
    assert_eq!(find(&locals, "sum")["value"], "5");

    let globals = target.variables(scopes[3]["variablesReference"].as_i64().unwrap());
    assert_eq!(names(&globals), ["config"]);
    assert_eq!(globals[0]["type"], "table");
    let config = globals[0]["variablesReference"].as_i64().unwrap();
    assert!(config > 0);

    let fields = target.variables(config);
    assert_eq!(names(&fields), ["name", "[1]", "[2]"]);
    assert_eq!(fields[0]["value"], "\"demo\"");
    assert_eq!(fields[2]["value"], "20");

    let defaults = target.variables(scopes[4]["variablesReference"].as_i64().unwrap());
    let defaults = names(&defaults);
    assert!(defaults.contains(&"pcall"));
    assert!(defaults.contains(&"string"));
    assert!(!defaults.contains(&"config"));

    target.continue_();
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn references_die_when_the_script_resumes() {
    let mut target = DebugTarget::spawn(ADD);
    target.start(&[4, 8]);
    target.stopped();

    let frame = target.top_frame();
    let globals = target.scope_reference(&frame["id"], "Globals");
    let config = target.variables(globals)[0]["variablesReference"]
        .as_i64()
        .unwrap();

    target.continue_();
    target.stopped();

    let response = target.call_err("variables", json!({ "variablesReference": config }));
    assert_eq!(response["message"], "unknownReference");

    let frame = target.top_frame();
    let fresh = target.scope_reference(&frame["id"], "Globals");
    assert_ne!(fresh, globals);
    assert_ne!(fresh, config);

    target.continue_();
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn setting_breakpoints_replaces_the_file_set() {
    let mut target = DebugTarget::spawn(
        "local hits = 0\n\
         for i = 1, 3 do\n\
         hits = hits + i\n\
         end\n\
         print(hits)\n",
    );
    target.start(&[3]);

    target.stopped();
    target.continue_();
    target.stopped();

    let cleared = target.set_breakpoints(&[]);
    assert!(cleared.is_empty());
    target.continue_();

    assert_eq!(target.run_to_end(), "6\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn unknown_sources_are_reported_unverified() {
    let mut target = DebugTarget::spawn("local x = 1\n");
    target.initialize();
    let body = target.call(
        "setBreakpoints",
        json!({ "source": { "path": "/no/such/file.lua" }, "breakpoints": [{ "line": 1 }] }),
    );
    assert_eq!(body["breakpoints"][0]["verified"], false);

    let response = target.call_err("setBreakpoints", json!({ "source": {} }));
    assert_eq!(response["message"], "invalidArguments");

    target.call("launch", json!({}));
    target.call("configurationDone", json!({}));
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}
