use mlua::{UserData, UserDataFields, UserDataMethods};
use serde_json::{json, Value};

use crate::harness::{find, names, DebugTarget};

const ADD: &str = "\
config = { name = \"demo\", 10, 20 }
local function add(a, b)
  local sum = a + b
  return sum
end
local total = add(2, 3)
print(total)
";

fn evaluate(target: &mut DebugTarget, expression: &str, frame_id: Option<&Value>) -> Value {
    let mut arguments = json!({ "expression": expression, "context": "repl" });
    if let Some(frame_id) = frame_id {
        arguments["frameId"] = frame_id.clone();
    }
    target.call("evaluate", arguments)
}

#[test]
fn evaluate_sees_the_frame_and_primitives_have_no_children() {
    let mut target = DebugTarget::spawn(ADD);
    target.start(&[4]);
    target.stopped();
    let frame = target.top_frame()["id"].clone();

    let sum = evaluate(&mut target, "a + b", Some(&frame));
    assert_eq!(sum["result"], "5");
    assert_eq!(sum["type"], "integer");
    assert_eq!(sum["variablesReference"], 0);

    let constant = evaluate(&mut target, "2+2", None);
    assert_eq!(constant["result"], "4");
    assert_eq!(constant["variablesReference"], 0);

    let several = evaluate(&mut target, "sum, 'x'", Some(&frame));
    assert_eq!(several["result"], "5\t\"x\"");
    assert_eq!(several["type"], "integer");

    let table = evaluate(&mut target, "config", Some(&frame));
    assert_eq!(table["type"], "table");
    let reference = table["variablesReference"].as_i64().unwrap();
    assert!(reference > 0);
    assert_eq!(names(&target.variables(reference)), ["name", "[1]", "[2]"]);

    target.continue_();
    assert_eq!(target.run_to_end(), "5\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn evaluate_cannot_change_the_script() {
    let mut target = DebugTarget::spawn(ADD);
    target.start(&[4]);
    target.stopped();
    let frame = target.top_frame()["id"].clone();

    let assigned = evaluate(
        &mut target,
        "(function() sum = 100; leaked = true; return sum end)()",
        Some(&frame),
    );
    assert_eq!(assigned["result"], "100");
    assert_eq!(evaluate(&mut target, "sum", Some(&frame))["result"], "5");
    assert_eq!(evaluate(&mut target, "leaked", None)["result"], "nil");

    target.continue_();
    assert_eq!(target.run_to_end(), "5\n");
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn evaluate_errors_are_reported_to_the_client() {
    let mut target = DebugTarget::spawn(ADD);
    target.start(&[4]);
    target.stopped();
    let frame = target.top_frame()["id"].clone();

    let response = target.call_err(
        "evaluate",
        json!({ "expression": "nosuch.field", "frameId": frame }),
    );
    assert_eq!(response["message"], "evaluationFailed");
    let format = response["body"]["error"]["format"].as_str().unwrap();
    assert!(format.contains("attempt to index"), "{format}");

    let response = target.call_err("evaluate", json!({ "expression": "sum =" }));
    assert_eq!(response["message"], "evaluationFailed");

    let response = target.call_err("evaluate", json!({ "expression": "1", "frameId": 99 }));
    assert_eq!(response["message"], "unknownFrame");

    target.continue_();
    target.run_to_end();
    assert_eq!(target.finish(), Ok(()));
}

#[test]
fn objects_with_methods_list_their_own_fields() {
    let mut target = DebugTarget::spawn(
        "local Point = {}\n\
         Point.__index = Point\n\
         function Point:getX() return self.x end\n\
         function Point:isOrigin() return self.x == 0 end\n\
         function Point:getBroken() error('no') end\n\
         local p = setmetatable({ x = 3 }, Point)\n\
         print(p.x)\n",
    );
    target.start(&[7]);
    target.stopped();
    let frame = target.top_frame()["id"].clone();

    let point = evaluate(&mut target, "p", Some(&frame));
    let fields = target.variables(point["variablesReference"].as_i64().unwrap());
    assert_eq!(names(&fields), ["x"]);
    assert_eq!(fields[0]["value"], "3");

    target.continue_();
    assert_eq!(target.run_to_end(), "3\n");
    assert_eq!(target.finish(), Ok(()));
}

struct Size {
    width: i64,
    height: i64,
}

impl UserData for Size {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("width", |_, this| Ok(this.width));
        fields.add_field_method_get("height", |_, this| Ok(this.height));
        fields.add_meta_field(
            lua_dap::format::GETTERS_METAFIELD,
            vec!["width", "height", "getArea", "isSquare", "getBroken"],
        );
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("getArea", |_, this, ()| Ok(this.width * this.height));
        methods.add_method("isSquare", |_, this, ()| Ok(this.width == this.height));
        methods.add_method("getBroken", |_, _, ()| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError("sensor offline".to_owned()))
        });
    }
}

#[test]
fn host_userdata_shows_fields_and_getters() {
    let mut target = DebugTarget::spawn_with(
        "local size = new_size(3, 4)\n\
         print(size.width)\n",
        Box::new(|lua: &mlua::Lua| -> mlua::Result<()> {
            let new_size = lua.create_function(|_, (width, height): (i64, i64)| {
                Ok(Size { width, height })
            })?;
            lua.globals().set("new_size", new_size)
        }),
    );
    target.start(&[2]);
    target.stopped();
    let frame = target.top_frame()["id"].clone();

    let size = evaluate(&mut target, "size", Some(&frame));
    assert_eq!(size["type"], "userdata");
    let reference = size["variablesReference"].as_i64().unwrap();
    assert!(reference > 0);

    let members = target.variables(reference);
    assert_eq!(
        names(&members),
        ["getArea", "getBroken", "height", "isSquare", "width"]
    );
    assert_eq!(find(&members, "width")["value"], "3");
    assert_eq!(find(&members, "height")["value"], "4");
    assert_eq!(find(&members, "getArea")["value"], "12");
    assert_eq!(find(&members, "isSquare")["value"], "false");
    let broken = find(&members, "getBroken");
    assert_eq!(broken["type"], "error");
    assert!(broken["value"].as_str().unwrap().contains("sensor offline"));

    target.continue_();
    assert_eq!(target.run_to_end(), "3\n");
    assert_eq!(target.finish(), Ok(()));
}
