//! Field arguments and storage key canonicalization.
//!
//! A storage key is a field's schema name followed by its resolved, non-null arguments sorted by
//! name, each value serialized as canonical JSON (object keys sorted recursively, list order
//! preserved): `friends(first:10,orderBy:{"direction":"ASC","field":"NAME"})`. A field without
//! non-null arguments is stored under its bare name. Aliases never participate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

/// Variable bindings for an operation or fragment.
pub type Variables = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgumentValue,
}

impl Argument {
    pub fn literal<S: Into<String>>(name: S, value: Value) -> Self {
        Argument {
            name: name.into(),
            value: ArgumentValue::Literal(value),
        }
    }

    pub fn variable<S: Into<String>, V: Into<String>>(name: S, variable: V) -> Self {
        Argument {
            name: name.into(),
            value: ArgumentValue::Variable(variable.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
    Object(Vec<Argument>),
    List(Vec<ArgumentValue>),
}

impl ArgumentValue {
    /// Substitute variables. A variable with no binding resolves to null.
    pub fn resolve(&self, variables: &Variables) -> Value {
        match self {
            ArgumentValue::Literal(value) => value.clone(),
            ArgumentValue::Variable(name) => match variables.get(name) {
                Some(value) => value.clone(),
                None => {
                    tracing::debug!("Variable ${name} has no binding, resolving to null");
                    Value::Null
                }
            },
            ArgumentValue::Object(fields) => Value::Object(argument_values(fields, variables)),
            ArgumentValue::List(items) => {
                Value::Array(items.iter().map(|item| item.resolve(variables)).collect())
            }
        }
    }
}

pub fn argument_values(args: &[Argument], variables: &Variables) -> Variables {
    args.iter()
        .map(|arg| (arg.name.clone(), arg.value.resolve(variables)))
        .collect()
}

/// Serialize a value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

pub fn format_storage_key(name: &str, values: &Variables) -> String {
    let mut present = values
        .iter()
        .filter(|(_, value)| !value.is_null())
        .collect::<Vec<_>>();
    if present.is_empty() {
        return name.to_string();
    }
    present.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
    let args = present
        .into_iter()
        .map(|(arg, value)| format!("{arg}:{}", canonical_json(value)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}({args})")
}

pub fn storage_key(name: &str, args: &[Argument], variables: &Variables) -> String {
    if args.is_empty() {
        return name.to_string();
    }
    format_storage_key(name, &argument_values(args, variables))
}

/// Name of the client field a handle maintains: `__<key>_<handle>`, or `__<field>_<handle>` when
/// the handle has no key.
pub fn handle_field_name(handle: &str, key: Option<&str>, field_name: &str) -> String {
    match key {
        Some(key) if !key.is_empty() => format!("__{key}_{handle}"),
        _ => format!("__{field_name}_{handle}"),
    }
}

/// Storage key of a handle field: the handle name plus only the arguments named in `filters`.
pub fn handle_storage_key(
    handle_name: &str,
    args: &[Argument],
    filters: Option<&[String]>,
    variables: &Variables,
) -> String {
    let Some(filters) = filters else {
        return handle_name.to_string();
    };
    let filtered = args
        .iter()
        .filter(|arg| filters.contains(&arg.name))
        .cloned()
        .collect::<Vec<_>>();
    storage_key(handle_name, &filtered, variables)
}
