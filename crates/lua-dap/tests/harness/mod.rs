//! Runs a script under a [`DebugSession`] on a dedicated thread and plays the
//! client side over a [`MemoryTransport`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use lua_dap::runtime::{debug_lua, error_message, load_script};
use lua_dap::{DebugSession, MemoryClient, MemoryTransport, SessionOptions};
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(10);

/// What the script thread ended with: `Err` carries the script's error message.
pub type ScriptOutcome = Result<(), String>;

/// Prepares the state before the session attaches, the way a host would.
pub type HostSetup = Box<dyn FnOnce(&mlua::Lua) -> mlua::Result<()> + Send>;

pub struct DebugTarget {
    client: MemoryClient,
    seq: i64,
    /// Messages read while waiting for something else, in arrival order.
    backlog: VecDeque<Value>,
    script: Option<JoinHandle<ScriptOutcome>>,
    path: String,
    _dir: tempfile::TempDir,
}

fn no_setup(_: &mlua::Lua) -> mlua::Result<()> {
    Ok(())
}

fn run_script(transport: MemoryTransport, path: PathBuf, setup: HostSetup) -> ScriptOutcome {
    let lua = debug_lua();
    setup(&lua).map_err(|err| format!("host setup failed: {err}"))?;
    let session = DebugSession::connect(&lua, transport, SessionOptions::default())
        .map_err(|err| err.to_string())?;
    session
        .init()
        .map_err(|err| format!("configuration failed: {err}"))?;

    let script = load_script(&lua, &path).map_err(|err| err.to_string())?;
    let result = script.call::<()>(());
    if let Err(err) = &result {
        if !session.was_terminated() {
            session.report_fatal_error(err);
        }
    }
    session.deinit();
    result.map_err(|err| error_message(&err))
}

impl DebugTarget {
    /// Writes `source` to a temporary `script.lua` and starts a session for it.
    /// The script runs once the client finishes configuration.
    pub fn spawn(source: &str) -> Self {
        Self::spawn_with(source, Box::new(no_setup))
    }

    /// Like [`DebugTarget::spawn`], running `setup` on the fresh state first.
    pub fn spawn_with(source: &str, setup: HostSetup) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.lua");
        std::fs::write(&path, source).unwrap();

        let (transport, client) = MemoryTransport::pair();
        let script_path = path.clone();
        let script = std::thread::spawn(move || run_script(transport, script_path, setup));

        Self {
            client,
            seq: 0,
            backlog: VecDeque::new(),
            script: Some(script),
            path: path.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> i64 {
        self.seq += 1;
        let message = json!({
            "seq": self.seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        assert!(self.client.send(message), "adapter is gone ({command})");
        self.seq
    }

    pub fn send_raw(&self, text: &str) {
        assert!(self.client.send_raw(text), "adapter is gone");
    }

    /// Next message from the adapter, ignoring stack-trace update events.
    pub fn next_message(&mut self) -> Value {
        loop {
            let message = match self.client.recv_timeout(TIMEOUT) {
                Ok(message) => message,
                Err(err) => panic!("no message from the adapter: {err:?}"),
            };
            if message["event"] != "stackTraceUpdate" {
                return message;
            }
        }
    }

    /// Next response, queueing the events that arrive before it.
    pub fn next_response(&mut self) -> Value {
        loop {
            let message = self.next_message();
            if message["type"] == "response" {
                return message;
            }
            self.backlog.push_back(message);
        }
    }

    pub fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.send_request(command, arguments);
        let response = self.next_response();
        assert_eq!(response["request_seq"], seq, "unexpected response: {response}");
        assert_eq!(response["command"], command);
        response
    }

    /// Sends a request that must succeed and returns its body.
    pub fn call(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments);
        assert_eq!(response["success"], true, "{command} failed: {response}");
        response["body"].clone()
    }

    /// Sends a request that must fail and returns the response.
    pub fn call_err(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments);
        assert_eq!(response["success"], false, "{command} succeeded: {response}");
        response
    }

    /// Waits for the named event, skipping (and keeping) anything else.
    pub fn event(&mut self, name: &str) -> Value {
        if let Some(index) = self.backlog.iter().position(|message| message["event"] == name) {
            return self.backlog.remove(index).unwrap();
        }
        loop {
            let message = self.next_message();
            if message["type"] == "event" && message["event"] == name {
                return message;
            }
            self.backlog.push_back(message);
        }
    }

    pub fn initialize(&mut self) -> Value {
        let body = self.call(
            "initialize",
            json!({ "adapterID": "lua", "linesStartAt1": true, "pathFormat": "path" }),
        );
        self.event("initialized");
        body
    }

    pub fn set_breakpoints(&mut self, lines: &[u32]) -> Vec<Value> {
        let breakpoints: Vec<Value> = lines.iter().map(|line| json!({ "line": line })).collect();
        let body = self.call(
            "setBreakpoints",
            json!({ "source": { "path": self.path.clone() }, "breakpoints": breakpoints }),
        );
        body["breakpoints"].as_array().cloned().unwrap_or_default()
    }

    /// Full configuration handshake; the script starts running on return.
    pub fn start(&mut self, breakpoints: &[u32]) -> Vec<Value> {
        self.initialize();
        self.call("launch", json!({}));
        let resolved = if breakpoints.is_empty() {
            Vec::new()
        } else {
            self.set_breakpoints(breakpoints)
        };
        self.call("configurationDone", json!({}));
        resolved
    }

    /// Body of the next `stopped` event.
    pub fn stopped(&mut self) -> Value {
        self.event("stopped")["body"].clone()
    }

    pub fn stack_frames(&mut self) -> Vec<Value> {
        let body = self.call("stackTrace", json!({ "threadId": 1 }));
        body["stackFrames"].as_array().cloned().unwrap_or_default()
    }

    pub fn top_frame(&mut self) -> Value {
        self.stack_frames().remove(0)
    }

    pub fn scopes(&mut self, frame_id: &Value) -> Vec<Value> {
        let body = self.call("scopes", json!({ "frameId": frame_id }));
        body["scopes"].as_array().cloned().unwrap_or_default()
    }

    pub fn scope_reference(&mut self, frame_id: &Value, name: &str) -> i64 {
        self.scopes(frame_id)
            .into_iter()
            .find(|scope| scope["name"] == name)
            .and_then(|scope| scope["variablesReference"].as_i64())
            .unwrap_or_else(|| panic!("no {name} scope"))
    }

    pub fn variables(&mut self, reference: i64) -> Vec<Value> {
        let body = self.call("variables", json!({ "variablesReference": reference }));
        body["variables"].as_array().cloned().unwrap_or_default()
    }

    pub fn continue_(&mut self) {
        let body = self.call("continue", json!({ "threadId": 1 }));
        assert_eq!(body["allThreadsContinued"], true);
    }

    /// Collects `output` until `terminated`. Fails on any stop along the way.
    pub fn run_to_end(&mut self) -> String {
        let mut output = String::new();
        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None => self.next_message(),
            };
            match message["event"].as_str() {
                Some("terminated") => return output,
                Some("output") => output.push_str(message["body"]["output"].as_str().unwrap_or("")),
                Some("stopped") => panic!("unexpected stop: {message}"),
                _ => {}
            }
        }
    }

    /// The adapter closed its side and sent nothing else.
    pub fn assert_closed(&mut self) {
        if let Some(message) = self.backlog.pop_front() {
            panic!("unread message: {message}");
        }
        loop {
            match self.client.recv_timeout(TIMEOUT) {
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => panic!("transport still open"),
                Ok(message) if message["event"] == "stackTraceUpdate" => continue,
                Ok(message) => panic!("unexpected message after close: {message}"),
            }
        }
    }

    /// Waits for the script thread.
    pub fn finish(mut self) -> ScriptOutcome {
        let script = self.script.take().unwrap();
        script.join().expect("script thread panicked")
    }
}

pub fn names(variables: &[Value]) -> Vec<&str> {
    variables
        .iter()
        .map(|variable| variable["name"].as_str().unwrap_or_default())
        .collect()
}

pub fn find<'a>(variables: &'a [Value], name: &str) -> &'a Value {
    variables
        .iter()
        .find(|variable| variable["name"] == name)
        .unwrap_or_else(|| panic!("no variable {name} in {variables:?}"))
}
