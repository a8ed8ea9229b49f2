use std::collections::HashMap;

use mlua::Value;

use crate::error::{DebugError, DebugResult};
use crate::handles::HandleArena;

/// Largest `variablesReference` handed out.
///
/// Many DAP clients parse `variablesReference` as an `i32`.
pub const MAX_VARIABLES_REFERENCE: i64 = 0x7fff_ffff;

/// Default maximum number of references kept between two resumes.
///
/// Expanding large object graphs registers one reference per structured
/// child; without a bound a single stop could grow memory without limit.
pub const DEFAULT_MAX_REFERENCES: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Locals,
    Arguments,
    Upvalues,
    /// Globals defined after the session connected.
    Globals,
    /// Globals that existed when the session connected.
    GlobalsDefault,
    Temporaries,
    /// A table, or a host object that can be iterated with `pairs`.
    TableLike,
    /// A host object exposing `get*`/`is*` accessors through `__index`.
    Getters,
}

impl ScopeKind {
    pub fn scope_name(self) -> &'static str {
        match self {
            ScopeKind::Locals => "Locals",
            ScopeKind::Arguments => "Arguments",
            ScopeKind::Upvalues => "Upvalues",
            ScopeKind::Globals => "Globals",
            ScopeKind::GlobalsDefault => "Globals (default)",
            ScopeKind::Temporaries => "Temporaries",
            ScopeKind::TableLike => "Table",
            ScopeKind::Getters => "Getters",
        }
    }
}

/// What a reference points at.
#[derive(Clone, Debug)]
pub enum ScopeTarget {
    /// A frame, by runtime level relative to the hooked function.
    Frame(usize),
    Value(Value),
    Global,
}

#[derive(Clone, Debug)]
pub struct ScopeInfo {
    pub kind: ScopeKind,
    pub target: ScopeTarget,
}

/// Stop-scoped `variablesReference` table.
///
/// Everything is dropped on resume, and references issued before a clear are
/// never valid again.
pub struct ObjectRegistry {
    scopes: HandleArena<ScopeInfo>,
    by_value: HashMap<(ScopeKind, usize), i64>,
    max_references: usize,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_references(max_references: usize) -> Self {
        Self {
            max_references,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Registers `target`; `0` once the registry is full.
    pub fn register(&mut self, kind: ScopeKind, target: ScopeTarget) -> i64 {
        let identity = match &target {
            ScopeTarget::Value(value) => Some((kind, value.to_pointer() as usize)),
            _ => None,
        };
        if let Some(reference) = identity.and_then(|key| self.by_value.get(&key)) {
            return *reference;
        }
        if self.scopes.len() >= self.max_references {
            tracing::debug!(
                target: "lua_dap.variables",
                max = self.max_references,
                "variables reference limit reached"
            );
            return 0;
        }

        let reference = self.scopes.insert(ScopeInfo { kind, target });
        if reference > MAX_VARIABLES_REFERENCE {
            tracing::warn!(target: "lua_dap.variables", "variables reference space exhausted");
            return 0;
        }
        if let Some(key) = identity {
            self.by_value.insert(key, reference);
        }
        reference
    }

    pub fn get(&self, reference: i64) -> DebugResult<&ScopeInfo> {
        self.scopes
            .get(reference)
            .ok_or(DebugError::UnknownVariablesReference(reference))
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
        self.by_value.clear();
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self {
            scopes: HandleArena::default(),
            by_value: HashMap::new(),
            max_references: DEFAULT_MAX_REFERENCES,
        }
    }
}
