//! Helpers for hosts embedding the debugger.

use std::path::Path;

use mlua::{Function, Lua, LuaOptions, StdLib};

use crate::error::{DebugError, DebugResult};

/// A Lua 5.4 state with the safe standard libraries plus `debug`.
pub fn debug_lua() -> Lua {
    // SAFETY: `debug` is only loaded for stack introspection. The scripts the
    // adapter runs are trusted by the host exactly as much as without it.
    unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::new()) }
}

/// Chunk name the runtime reports for a script loaded from `path`.
pub fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

/// Compiles a script file without running it.
pub fn load_script(lua: &Lua, path: &Path) -> DebugResult<Function> {
    let code = std::fs::read_to_string(path).map_err(|source| DebugError::Script {
        path: path.display().to_string(),
        source,
    })?;
    Ok(lua.load(code).set_name(chunk_name(path)).into_function()?)
}

/// The message a script would see for `err`, without mlua's decorations or a traceback.
pub fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => match message.split_once("\nstack traceback:") {
            Some((message, _)) => message.to_owned(),
            None => message.clone(),
        },
        mlua::Error::MemoryError(message)
        | mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            error_message(cause)
        }
        other => other.to_string(),
    }
}
