//! Access to the runtime's own stack introspection (`debug.getinfo`,
//! `debug.getlocal`, `debug.getupvalue`), captured before a script can
//! replace or remove the `debug` library.
//!
//! Every level accepted here is relative to the hooked function: level 0 is
//! the function whose event is being handled, level 1 its caller, and so on.
//! The distance between that and the level the runtime expects (which counts
//! the introspection call itself and whatever the host stack adds) is measured
//! once by [`Introspection::calibrate`] and applied in one place.

use std::cell::Cell;
use std::rc::Rc;

use mlua::{Function, HookTriggers, Lua, Table, Value, VmState};

use crate::error::{DebugError, DebugResult};
use crate::trace::{FrameInfo, FrameKind, FunctionId};

const CALIBRATION_CHUNK: &str = "=(calibrate)";
const INDEX_CHUNK: &str = "=(index)";
const MAX_CALIBRATION_DEPTH: i64 = 16;

pub struct Introspection {
    getinfo: Function,
    getlocal: Function,
    getupvalue: Function,
    getmetatable: Function,
    tostring: Function,
    pairs: Function,
    index: Function,
    level_offset: i64,
}

/// Entries read from one structured value before the rest is ignored.
pub const MAX_PAIRS: usize = 10_000;

impl Introspection {
    pub fn capture(lua: &Lua) -> DebugResult<Self> {
        let globals = lua.globals();
        let debug: Table = match globals.get::<Value>("debug")? {
            Value::Table(debug) => debug,
            _ => return Err(DebugError::MissingDebugLibrary),
        };
        let function = |name: &str| -> DebugResult<Function> {
            match debug.get::<Value>(name)? {
                Value::Function(function) => Ok(function),
                _ => Err(DebugError::MissingDebugLibrary),
            }
        };

        Ok(Self {
            getinfo: function("getinfo")?,
            getlocal: function("getlocal")?,
            getupvalue: function("getupvalue")?,
            getmetatable: function("getmetatable")?,
            tostring: globals.get("tostring")?,
            pairs: globals.get("pairs")?,
            index: lua
                .load("local value, key = ...\nreturn value[key]")
                .set_name(INDEX_CHUNK)
                .into_function()?,
            level_offset: 0,
        })
    }

    /// Measures the level offset by running a probe chunk under a line hook.
    ///
    /// Replaces any installed hook; call before installing the debug hook.
    pub fn calibrate(&mut self, lua: &Lua) -> DebugResult<i64> {
        let found = Rc::new(Cell::new(None));
        let probe = found.clone();
        let getinfo = self.getinfo.clone();

        lua.set_hook(HookTriggers::new().every_line(), move |_lua, _debug| {
            if probe.get().is_some() {
                return Ok(VmState::Continue);
            }
            for level in 0..MAX_CALIBRATION_DEPTH {
                let Value::Table(info) = getinfo.call::<Value>((level, "S"))? else {
                    break;
                };
                if info.get::<Option<String>>("source")?.as_deref() == Some(CALIBRATION_CHUNK) {
                    probe.set(Some(level));
                    break;
                }
            }
            Ok(VmState::Continue)
        });
        let result = lua
            .load("local calibrated = true")
            .set_name(CALIBRATION_CHUNK)
            .exec();
        lua.remove_hook();
        result?;

        let offset = found.get().ok_or_else(|| {
            DebugError::Lua(mlua::Error::RuntimeError(
                "hooked frame not found while calibrating".to_owned(),
            ))
        })?;
        tracing::debug!(target: "lua_dap.introspection", offset, "calibrated level offset");
        self.level_offset = offset;
        Ok(offset)
    }

    pub fn level_offset(&self) -> i64 {
        self.level_offset
    }

    fn level(&self, level: usize) -> i64 {
        self.level_offset + level as i64
    }

    fn info(&self, level: usize, what: &str) -> DebugResult<Option<Table>> {
        match self.getinfo.call::<Value>((self.level(level), what))? {
            Value::Table(info) => Ok(Some(info)),
            _ => Ok(None),
        }
    }

    pub fn frame_info(&self, level: usize) -> DebugResult<Option<FrameInfo>> {
        let Some(info) = self.info(level, "nSlf")? else {
            return Ok(None);
        };
        let what: String = info.get::<Option<String>>("what")?.unwrap_or_default();
        let kind = match what.as_str() {
            "C" => FrameKind::Native,
            "main" => FrameKind::Main,
            _ => FrameKind::Lua,
        };
        let current_line = info.get::<Option<i64>>("currentline")?.unwrap_or(-1);
        let line_defined = info.get::<Option<i64>>("linedefined")?.unwrap_or(0).max(0) as u32;
        let line = if current_line > 0 {
            current_line as u32
        } else {
            line_defined
        };

        Ok(Some(FrameInfo {
            name: info.get::<Option<String>>("name")?,
            source: info.get::<Option<String>>("source")?.unwrap_or_default(),
            line,
            line_defined,
            kind,
            function: FunctionId::of(&info.get::<Value>("func")?),
        }))
    }

    pub fn function_at(&self, level: usize) -> DebugResult<Option<FunctionId>> {
        Ok(self
            .function_value(level)?
            .and_then(|function| FunctionId::of(&Value::Function(function))))
    }

    pub fn function_value(&self, level: usize) -> DebugResult<Option<Function>> {
        let Some(info) = self.info(level, "f")? else {
            return Ok(None);
        };
        match info.get::<Value>("func")? {
            Value::Function(function) => Ok(Some(function)),
            _ => Ok(None),
        }
    }

    /// `(nparams, isvararg)` of the function at `level`.
    pub fn parameters(&self, level: usize) -> DebugResult<(usize, bool)> {
        let Some(info) = self.info(level, "u")? else {
            return Ok((0, false));
        };
        let nparams = info.get::<Option<i64>>("nparams")?.unwrap_or(0).max(0) as usize;
        let is_vararg = info.get::<Option<bool>>("isvararg")?.unwrap_or(false);
        Ok((nparams, is_vararg))
    }

    /// Every active local at `level`, parameters first, in declaration order.
    pub fn locals(&self, level: usize) -> DebugResult<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for index in 1.. {
            let (name, value) = self
                .getlocal
                .call::<(Option<String>, Value)>((self.level(level), index))?;
            let Some(name) = name else { break };
            out.push((name, value));
        }
        Ok(out)
    }

    pub fn varargs(&self, level: usize) -> DebugResult<Vec<Value>> {
        let mut out = Vec::new();
        for index in 1.. {
            let (name, value) = self
                .getlocal
                .call::<(Option<String>, Value)>((self.level(level), -index))?;
            if name.is_none() {
                break;
            }
            out.push(value);
        }
        Ok(out)
    }

    pub fn upvalues(&self, level: usize) -> DebugResult<Vec<(String, Value)>> {
        let Some(function) = self.function_value(level)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for index in 1.. {
            let (name, value) = self
                .getupvalue
                .call::<(Option<String>, Value)>((function.clone(), index))?;
            let Some(name) = name else { break };
            out.push((name, value));
        }
        Ok(out)
    }

    /// The runtime's own `tostring`, immune to a script replacing the global.
    pub fn tostring(&self, value: &Value) -> Option<String> {
        self.tostring.call::<String>(value.clone()).ok()
    }

    /// Raw metatable of any value, ignoring `__metatable`.
    pub fn metatable(&self, value: &Value) -> DebugResult<Option<Table>> {
        match self.getmetatable.call::<Value>(value.clone())? {
            Value::Table(metatable) => Ok(Some(metatable)),
            _ => Ok(None),
        }
    }

    /// `value[key]`, metamethods included.
    pub fn index(&self, value: &Value, key: &str) -> mlua::Result<Value> {
        self.index.call((value.clone(), key))
    }

    /// Iterates `value` the way the script's `pairs` would, honouring `__pairs`.
    pub fn pairs(&self, value: &Value) -> DebugResult<Vec<(Value, Value)>> {
        let (next, state, mut control) = self.pairs.call::<(Function, Value, Value)>(value.clone())?;
        let mut out = Vec::new();
        while out.len() < MAX_PAIRS {
            let (key, item) = next.call::<(Value, Value)>((state.clone(), control))?;
            if key.is_nil() {
                break;
            }
            control = key.clone();
            out.push((key, item));
        }
        Ok(out)
    }
}
