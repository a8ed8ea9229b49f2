use serde_json::json;

use crate::harness::DebugTarget;

#[test]
fn initialize_response_precedes_the_initialized_event() {
    let mut target = DebugTarget::spawn("local x = 1\n");
    let seq = target.send_request("initialize", json!({ "adapterID": "lua" }));

    let response = target.next_message();
    assert_eq!(response["type"], "response");
    assert_eq!(response["request_seq"], seq);
    assert_eq!(response["success"], true);
    let body = &response["body"];
    assert_eq!(body["supportsConfigurationDoneRequest"], true);
    assert_eq!(body["supportsExceptionInfoRequest"], true);
    assert_eq!(body["exceptionBreakpointFilters"][0]["filter"], "uncaught");
    assert_eq!(body["exceptionBreakpointFilters"][0]["default"], true);
    assert_eq!(body["exceptionBreakpointFilters"][1]["filter"], "caught");
    assert_eq!(body["exceptionBreakpointFilters"][1]["default"], false);

    let event = target.next_message();
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "initialized");

    target.call("launch", json!({}));
    let threads = target.call("threads", json!({}));
    assert_eq!(threads["threads"], json!([{ "id": 1, "name": "main" }]));
    target.call("configurationDone", json!({}));

    assert_eq!(target.run_to_end(), "");
    target.assert_closed();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn malformed_input_is_answered_as_an_unbound_error() {
    let mut target = DebugTarget::spawn("local x = 1\n");
    target.send_raw("{not json");

    let response = target.next_response();
    assert_eq!(response["success"], false);
    assert_eq!(response["request_seq"], 1);
    assert_eq!(response["command"], "initialize");
    assert_eq!(response["message"], "malformedMessage");
    assert!(response["body"]["error"]["id"].is_u64());
    assert_eq!(response["body"]["error"]["showUser"], true);

    // The session carries on.
    target.start(&[]);
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn unknown_commands_are_rejected() {
    let mut target = DebugTarget::spawn("local x = 1\n");
    target.initialize();

    let response = target.call_err("frobnicate", json!({}));
    assert_eq!(response["message"], "notImplemented");
    let format = response["body"]["error"]["format"].as_str().unwrap();
    assert!(format.contains("frobnicate"), "{format}");

    let response = target.call_err("exceptionInfo", json!({ "threadId": 1 }));
    assert_eq!(response["message"], "noException");

    target.call("launch", json!({}));
    target.call("configurationDone", json!({}));
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn print_output_reaches_the_client() {
    let mut target = DebugTarget::spawn("print('hello', 42)\nprint(nil)\n");
    target.start(&[]);
    assert_eq!(target.run_to_end(), "hello\t42\nnil\n");
    target.assert_closed();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn no_debug_launch_runs_without_stopping() {
    let mut target = DebugTarget::spawn("local a = 1\nprint(a)\n");
    target.initialize();
    target.call("launch", json!({ "noDebug": true, "stopOnEntry": true }));
    target.set_breakpoints(&[2]);
    target.call("configurationDone", json!({}));

    assert_eq!(target.run_to_end(), "1\n");
    assert_eq!(target.finish(), Ok(()));
}
