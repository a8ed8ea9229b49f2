use serde_json::json;

use crate::harness::{names, DebugTarget};

const NESTED: &str = "\
local function inner()
  local x = 1
  return x
end
local function outer()
  local y = inner()
  return y + 1
end
local result = outer()
print(result)
";

fn step(target: &mut DebugTarget, command: &str) -> (String, i64) {
    target.call(command, json!({ "threadId": 1 }));
    let stop = target.stopped();
    assert_eq!(stop["reason"], "step", "{command}: {stop}");
    let frame = target.top_frame();
    (
        frame["name"].as_str().unwrap_or_default().to_owned(),
        frame["line"].as_i64().unwrap_or_default(),
    )
}

#[test]
fn step_in_enters_callees_and_step_out_returns() {
    let mut target = DebugTarget::spawn(NESTED);
    target.start(&[9]);
    assert_eq!(target.stopped()["reason"], "breakpoint");

    assert_eq!(step(&mut target, "stepIn"), ("outer".to_owned(), 6));
    assert_eq!(step(&mut target, "stepIn"), ("inner".to_owned(), 2));
    assert_eq!(target.stack_frames().len(), 3);

    // Suspends at the first line back in `outer`, past the call.
    assert_eq!(step(&mut target, "stepOut"), ("outer".to_owned(), 7));
    assert_eq!(target.stack_frames().len(), 2);

    assert_eq!(step(&mut target, "next"), ("main".to_owned(), 10));

    target.continue_();
    assert_eq!(target.run_to_end(), "2\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn next_steps_over_calls() {
    let mut target = DebugTarget::spawn(NESTED);
    target.start(&[6]);
    target.stopped();

    assert_eq!(step(&mut target, "next"), ("outer".to_owned(), 7));
    assert_eq!(step(&mut target, "next"), ("main".to_owned(), 10));

    target.continue_();
    assert_eq!(target.run_to_end(), "2\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn stop_on_entry_suspends_at_the_first_line() {
    let mut target = DebugTarget::spawn("local a = 1\nlocal b = a + 1\nprint(b)\n");
    target.initialize();
    target.call("launch", json!({ "stopOnEntry": true }));
    target.call("configurationDone", json!({}));

    assert_eq!(target.stopped()["reason"], "entry");
    assert_eq!(target.top_frame()["line"], 1);
    assert_eq!(step(&mut target, "next"), ("main".to_owned(), 2));

    target.continue_();
    assert_eq!(target.run_to_end(), "2\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn tail_calls_fold_into_one_frame_and_unwind_together() {
    let mut target = DebugTarget::spawn(
        "local function h()\n\
         return 42\n\
         end\n\
         local function g()\n\
         return h()\n\
         end\n\
         local function f()\n\
         return g()\n\
         end\n\
         local value = f()\n\
         print(value)\n",
    );
    target.start(&[2, 11]);

    target.stopped();
    let body = target.call("stackTrace", json!({ "threadId": 1 }));
    assert_eq!(body["totalFrames"], 2);
    assert_eq!(body["stackFrames"][0]["line"], 2);
    assert_eq!(body["stackFrames"][1]["name"], "main");
    assert_eq!(body["stackFrames"][1]["line"], 10);

    // `h` returning drops the whole tail-call run at once.
    target.continue_();
    target.stopped();
    let frames = target.stack_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["line"], 11);

    target.continue_();
    assert_eq!(target.run_to_end(), "42\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn coroutine_iterators_keep_a_consistent_stack() {
    let mut target = DebugTarget::spawn(
        "local function numbers(limit)\n\
         return coroutine.wrap(function()\n\
         for i = 1, limit do\n\
         coroutine.yield(i)\n\
         end\n\
         end)\n\
         end\n\
         local sum = 0\n\
         for n in numbers(3) do\n\
         sum = sum + n\n\
         end\n\
         print(sum)\n",
    );
    target.start(&[4, 10]);

    target.stopped();
    let frames = target.stack_frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["line"], 4);
    assert_eq!(frames[2]["name"], "main");
    assert_eq!(frames[2]["line"], 9);
    let i = target.call("evaluate", json!({ "expression": "i", "frameId": frames[0]["id"] }));
    assert_eq!(i["result"], "1");
    // The resumer's activation lives on another thread.
    assert_eq!(
        names(&target.scopes(&frames[2]["id"])),
        ["Globals", "Globals (default)"]
    );

    // Back in the loop body: the suspended coroutine is off the stack.
    target.continue_();
    target.stopped();
    let frames = target.stack_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["line"], 10);
    let n = target.call("evaluate", json!({ "expression": "n", "frameId": frames[0]["id"] }));
    assert_eq!(n["result"], "1");

    // Resumed with the frames it had when it yielded.
    target.continue_();
    target.stopped();
    let frames = target.stack_frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["line"], 4);
    let i = target.call("evaluate", json!({ "expression": "i", "frameId": frames[0]["id"] }));
    assert_eq!(i["result"], "2");

    target.set_breakpoints(&[]);
    target.continue_();
    // No console warnings about unbalanced returns either.
    assert_eq!(target.run_to_end(), "6\n");
    assert_eq!(target.finish(), Ok(()));
}
