//! `scopes`, `variables` and `evaluate`.
//!
//! Frame scopes read the suspended frame through [`Introspection`], addressed
//! by runtime level; structured values are registered lazily in the
//! [`ObjectRegistry`] as they are rendered, and every reference dies when the
//! script resumes.

use std::collections::BTreeSet;

use mlua::{MultiValue, Table, Value};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::context::SessionContext;
use crate::dap::messages::Request;
use crate::dap::types::{EvaluateResult, Scope, Variable};
use crate::error::{DebugError, DebugResult};
use crate::format::{is_getter_name, ValueFormatter, GETTERS_METAFIELD};
use crate::handler::DebugHandler;
use crate::introspection::Introspection;
use crate::object_registry::{ObjectRegistry, ScopeInfo, ScopeKind, ScopeTarget};
use crate::runtime::error_message;

const EVALUATE_CHUNK: &str = "=(evaluate)";
const VARARG_PREFIX: &str = "...";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArguments {
    frame_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArguments {
    variables_reference: i64,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArguments {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

/// A child value, or the error its getter raised.
type Child = (String, Result<Value, String>);

/// Locals of one frame, split the way the scopes present them.
#[derive(Default)]
struct FrameLocals {
    arguments: Vec<(String, Value)>,
    locals: Vec<(String, Value)>,
    temporaries: Vec<(String, Value)>,
}

fn frame_locals(introspection: &Introspection, level: usize) -> DebugResult<FrameLocals> {
    let (nparams, is_vararg) = introspection.parameters(level)?;
    let mut out = FrameLocals::default();
    for (index, (name, value)) in introspection.locals(level)?.into_iter().enumerate() {
        if index < nparams {
            out.arguments.push((name, value));
        } else if name.starts_with('(') {
            // Internal slots share names such as `(temporary)`.
            out.temporaries.push((format!("{name}[{}]", index + 1), value));
        } else {
            out.locals.push((name, value));
        }
    }
    if is_vararg {
        for (index, value) in introspection.varargs(level)?.into_iter().enumerate() {
            out.arguments
                .push((format!("{VARARG_PREFIX}[{}]", index + 1), value));
        }
    }
    Ok(out)
}

fn globals(ctx: &SessionContext, defaults: bool) -> DebugResult<Vec<(String, Value)>> {
    let mut out = Vec::new();
    for pair in ctx.lua.globals().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let Value::String(name) = key else {
            continue;
        };
        let name: String = name.to_string_lossy().into();
        if ctx.default_globals.contains(&name) == defaults {
            out.push((name, value));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Entries of a table-like value: named keys sorted, then integer keys in
/// order with zero-padded bracketed names.
fn table_entries(
    introspection: &Introspection,
    formatter: &ValueFormatter,
    value: &Value,
) -> DebugResult<Vec<(String, Value)>> {
    let mut named: Vec<(String, Value)> = Vec::new();
    let mut indexed = Vec::new();
    for (key, item) in introspection.pairs(value)? {
        match key {
            Value::Integer(index) => indexed.push((index, item)),
            Value::String(name) => named.push((name.to_string_lossy().into(), item)),
            other => named.push((
                format!("[{}]", formatter.format_value(introspection, &other).value),
                item,
            )),
        }
    }
    named.sort_by(|a, b| a.0.cmp(&b.0));
    indexed.sort_by_key(|(index, _)| *index);

    let width = indexed
        .iter()
        .map(|(index, _)| index.to_string().len())
        .max()
        .unwrap_or(0);
    named.extend(
        indexed
            .into_iter()
            .map(|(index, item)| (format!("[{index:0width$}]"), item)),
    );
    Ok(named)
}

/// Members a host object exposes: every `get*`/`is*` function of its
/// `__index` table, plus the names its `__getters` metafield lists. Getter
/// functions are called with the object; other members are shown as read.
fn getter_entries(introspection: &Introspection, value: &Value) -> DebugResult<Vec<Child>> {
    let Some(metatable) = introspection.metatable(value)? else {
        return Ok(Vec::new());
    };

    let mut members = BTreeSet::new();
    if let Value::Table(index) = metatable.raw_get::<Value>("__index")? {
        for pair in index.pairs::<Value, Value>() {
            if let (Value::String(name), Value::Function(_)) = pair? {
                let name: String = name.to_string_lossy().into();
                if is_getter_name(&name) {
                    members.insert(name);
                }
            }
        }
    }
    if let Value::Table(declared) = metatable.raw_get::<Value>(GETTERS_METAFIELD)? {
        for name in declared.sequence_values::<Value>() {
            if let Value::String(name) = name? {
                members.insert(name.to_string_lossy().into());
            }
        }
    }

    let mut out = Vec::with_capacity(members.len());
    for name in members {
        let result = introspection
            .index(value, &name)
            .and_then(|member| match member {
                Value::Function(getter) if is_getter_name(&name) => {
                    getter.call::<Value>(value.clone())
                }
                member => Ok(member),
            })
            .map_err(|err| error_message(&err));
        out.push((name, result));
    }
    Ok(out)
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

#[derive(Default)]
pub struct VariableInspector {
    objects: ObjectRegistry,
    formatter: ValueFormatter,
}

impl VariableInspector {
    /// Runtime level of a frame id the client got from `stackTrace`, when
    /// the frame still has a live activation.
    fn frame_level(ctx: &SessionContext, frame_id: i64) -> DebugResult<Option<usize>> {
        // Once the runtime unwound past the shadow stack only globals are real.
        if !ctx.state.frames_live {
            return Ok(None);
        }
        let id = usize::try_from(frame_id).map_err(|_| DebugError::UnknownFrame(frame_id))?;
        if !ctx.stack.visible_frames().iter().any(|frame| frame.id == id) {
            return Err(DebugError::UnknownFrame(frame_id));
        }
        Ok(ctx.runtime_level(id))
    }

    fn scopes(&mut self, ctx: &SessionContext, request: &Request) -> DebugResult<JsonValue> {
        let args: ScopesArguments = request.parse_arguments()?;
        let frame_kinds = [ScopeKind::Locals, ScopeKind::Arguments, ScopeKind::Upvalues];

        let mut scopes = Vec::new();
        let mut push = |objects: &mut ObjectRegistry, kind: ScopeKind, target: ScopeTarget| {
            let variables_reference = objects.register(kind, target);
            scopes.push(Scope {
                name: kind.scope_name().to_owned(),
                variables_reference,
                expensive: kind == ScopeKind::GlobalsDefault,
                presentation_hint: match kind {
                    ScopeKind::Locals => Some("locals"),
                    ScopeKind::Arguments => Some("arguments"),
                    ScopeKind::Temporaries => Some("registers"),
                    _ => None,
                },
            });
        };

        let level = Self::frame_level(ctx, args.frame_id)?;
        if let Some(level) = level {
            for kind in frame_kinds {
                push(&mut self.objects, kind, ScopeTarget::Frame(level));
            }
        }
        push(&mut self.objects, ScopeKind::Globals, ScopeTarget::Global);
        push(&mut self.objects, ScopeKind::GlobalsDefault, ScopeTarget::Global);
        if let Some(level) = level {
            push(&mut self.objects, ScopeKind::Temporaries, ScopeTarget::Frame(level));
        }

        Ok(json!({ "scopes": scopes }))
    }

    fn children(&self, ctx: &SessionContext, scope: &ScopeInfo) -> DebugResult<Vec<Child>> {
        let plain = |entries: Vec<(String, Value)>| -> Vec<Child> {
            entries
                .into_iter()
                .map(|(name, value)| (name, Ok(value)))
                .collect()
        };
        let introspection = &ctx.introspection;
        let entries = match (&scope.kind, &scope.target) {
            (ScopeKind::Locals, ScopeTarget::Frame(level)) => {
                plain(frame_locals(introspection, *level)?.locals)
            }
            (ScopeKind::Arguments, ScopeTarget::Frame(level)) => {
                plain(frame_locals(introspection, *level)?.arguments)
            }
            (ScopeKind::Temporaries, ScopeTarget::Frame(level)) => {
                plain(frame_locals(introspection, *level)?.temporaries)
            }
            (ScopeKind::Upvalues, ScopeTarget::Frame(level)) => {
                plain(introspection.upvalues(*level)?)
            }
            (ScopeKind::Globals, _) => plain(globals(ctx, false)?),
            (ScopeKind::GlobalsDefault, _) => plain(globals(ctx, true)?),
            (ScopeKind::TableLike, ScopeTarget::Value(value)) => {
                plain(table_entries(introspection, &self.formatter, value)?)
            }
            (ScopeKind::Getters, ScopeTarget::Value(value)) => getter_entries(introspection, value)?,
            _ => Vec::new(),
        };
        Ok(entries)
    }

    fn variable(&mut self, ctx: &SessionContext, name: String, value: Result<Value, String>) -> Variable {
        match value {
            Ok(value) => {
                let formatted = self.formatter.format_value(&ctx.introspection, &value);
                let variables_reference = match formatted.children {
                    Some(kind) => self.objects.register(kind, ScopeTarget::Value(value)),
                    None => 0,
                };
                Variable {
                    evaluate_name: name.clone(),
                    name,
                    value: formatted.value,
                    type_: formatted.type_name,
                    variables_reference,
                }
            }
            Err(message) => Variable {
                evaluate_name: name.clone(),
                name,
                value: format!("<error: {message}>"),
                type_: "error".to_owned(),
                variables_reference: 0,
            },
        }
    }

    fn variables(&mut self, ctx: &SessionContext, request: &Request) -> DebugResult<JsonValue> {
        let args: VariablesArguments = request.parse_arguments()?;
        let scope = self.objects.get(args.variables_reference)?.clone();
        let children = self.children(ctx, &scope)?;

        let start = args.start.unwrap_or(0).min(children.len());
        let count = match args.count {
            Some(count) if count > 0 => count,
            _ => children.len(),
        };
        let variables: Vec<Variable> = children
            .into_iter()
            .skip(start)
            .take(count)
            .map(|(name, value)| self.variable(ctx, name, value))
            .collect();
        Ok(json!({ "variables": variables }))
    }

    /// A private copy of everything visible from the frame, innermost names last.
    fn frame_environment(&self, ctx: &SessionContext, frame_id: i64) -> DebugResult<Table> {
        let env = ctx.lua.create_table()?;
        for (name, value) in globals(ctx, true)?.into_iter().chain(globals(ctx, false)?) {
            env.raw_set(name, value)?;
        }
        let Some(level) = Self::frame_level(ctx, frame_id)? else {
            return Ok(env);
        };
        let locals = frame_locals(&ctx.introspection, level)?;
        let arguments = locals
            .arguments
            .into_iter()
            .filter(|(name, _)| !name.starts_with(VARARG_PREFIX));
        for (name, value) in ctx
            .introspection
            .upvalues(level)?
            .into_iter()
            .chain(arguments)
            .chain(locals.locals)
        {
            env.raw_set(name, value)?;
        }
        Ok(env)
    }

    fn evaluate(&mut self, ctx: &SessionContext, request: &Request) -> DebugResult<JsonValue> {
        let args: EvaluateArguments = request.parse_arguments()?;
        let env = args
            .frame_id
            .map(|frame_id| self.frame_environment(ctx, frame_id))
            .transpose()?;

        let mut chunk = ctx
            .lua
            .load(format!("return {}", args.expression))
            .set_name(EVALUATE_CHUNK);
        if let Some(env) = env {
            chunk = chunk.set_environment(env);
        }
        let values = chunk
            .into_function()
            .and_then(|function| function.call::<MultiValue>(()))
            .map_err(|err| DebugError::Evaluation(first_line(&error_message(&err)).to_owned()))?;

        let mut rendered = Vec::with_capacity(values.len());
        let mut type_name = "nil".to_owned();
        let mut variables_reference = 0;
        for (index, value) in values.into_iter().enumerate() {
            let formatted = self.formatter.format_value(&ctx.introspection, &value);
            if index == 0 {
                type_name = formatted.type_name;
                if let Some(kind) = formatted.children {
                    variables_reference = self.objects.register(kind, ScopeTarget::Value(value));
                }
            }
            rendered.push(formatted.value);
        }
        let result = if rendered.is_empty() {
            "nil".to_owned()
        } else {
            rendered.join("\t")
        };

        Ok(json!(EvaluateResult {
            result,
            type_: type_name,
            variables_reference,
        }))
    }
}

impl DebugHandler for VariableInspector {
    fn commands(&self) -> &'static [&'static str] {
        &["scopes", "variables", "evaluate"]
    }

    fn handle_request(
        &mut self,
        ctx: &mut SessionContext,
        request: &Request,
    ) -> DebugResult<Option<JsonValue>> {
        match request.command.as_str() {
            "scopes" => self.scopes(ctx, request).map(Some),
            "variables" => self.variables(ctx, request).map(Some),
            "evaluate" => self.evaluate(ctx, request).map(Some),
            other => Err(DebugError::NotImplemented(other.to_owned())),
        }
    }

    fn on_continue(&mut self, _ctx: &mut SessionContext) {
        self.objects.clear();
    }
}
