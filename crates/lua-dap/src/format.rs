//! Display strings and type tags for runtime values.

use mlua::Value;

use crate::introspection::Introspection;
use crate::object_registry::ScopeKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedValue {
    pub value: String,
    pub type_name: String,
    /// How the value's children are listed, for values that have any.
    pub children: Option<ScopeKind>,
}

#[derive(Clone, Debug)]
pub struct ValueFormatter {
    max_string_len: usize,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self {
            max_string_len: 200,
        }
    }
}

impl ValueFormatter {
    pub fn format_value(&self, introspection: &Introspection, value: &Value) -> FormattedValue {
        let display = match value {
            Value::Nil => "nil".to_owned(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::String(s) => self.quote(&s.to_string_lossy()),
            _ => introspection
                .tostring(value)
                .unwrap_or_else(|| fallback_display(value)),
        };

        FormattedValue {
            value: display,
            type_name: value.type_name().to_owned(),
            children: children_kind(introspection, value),
        }
    }

    fn quote(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len().min(self.max_string_len) + 2);
        out.push('"');
        for (count, ch) in text.chars().enumerate() {
            if count == self.max_string_len {
                out.push_str("...");
                break;
            }
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                ch if ch.is_control() => out.push_str(&format!("\\{}", ch as u32)),
                ch => out.push(ch),
            }
        }
        out.push('"');
        out
    }
}

/// Used when `tostring` fails, e.g. a `__tostring` metamethod that raises.
fn fallback_display(value: &Value) -> String {
    format!("{}: {:p}", value.type_name(), value.to_pointer())
}

/// Metafield where a host lists the members of its userdata worth showing,
/// for objects whose `__index` is a function the inspector cannot walk.
pub const GETTERS_METAFIELD: &str = "__getters";

fn children_kind(introspection: &Introspection, value: &Value) -> Option<ScopeKind> {
    match value {
        Value::Table(_) => Some(ScopeKind::TableLike),
        Value::UserData(_) => {
            let metatable = introspection.metatable(value).ok().flatten()?;
            if metatable.raw_get::<Value>("__pairs").is_ok_and(|pairs| !pairs.is_nil()) {
                return Some(ScopeKind::TableLike);
            }
            let declared = matches!(
                metatable.raw_get::<Value>(GETTERS_METAFIELD),
                Ok(Value::Table(_))
            );
            match metatable.raw_get::<Value>("__index") {
                Ok(Value::Table(_)) => Some(ScopeKind::Getters),
                _ if declared => Some(ScopeKind::Getters),
                _ => None,
            }
        }
        _ => None,
    }
}

/// `get*` and `is*` members, which the inspector calls without arguments.
pub fn is_getter_name(name: &str) -> bool {
    let rest = name
        .strip_prefix("get")
        .or_else(|| name.strip_prefix("is"));
    matches!(rest, Some(rest) if rest.starts_with(|c: char| c.is_ascii_uppercase() || c == '_'))
}
