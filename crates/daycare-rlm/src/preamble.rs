//! Python stub declarations for the tools a script can call.
//!
//! The preamble is shown to the model and prepended to the script so that
//! static checking knows every host function's signature. The stubs sit under
//! `if False:` and never execute.

use daycare_core::Tool;
use serde_json::Value;

use crate::extract::RUN_PYTHON_TOOL;

/// Host function that ends the turn without a reply.
pub const SKIP_FUNCTION: &str = "skip";

const HEADER: &str = "\
# You have the following tools available as Python functions.
# Call tool functions directly (no await).
# Tool failures raise ToolError (alias of RuntimeError).
# Use print() for debug logs; the last expression is returned.

from typing import Any

ToolError = RuntimeError

# Typed tool stubs for code assistance only (not executed).
if False:
    def print(*values: Any) -> None:
        ...
";

/// Build the preamble for `tools`.
///
/// `run_python` itself and tools whose names are not Python identifiers are
/// left out. A `skip()` stub is always present.
pub fn preamble_build(tools: &[Tool]) -> String {
    let mut out = String::from(HEADER);
    for tool in tools {
        if tool.name == RUN_PYTHON_TOOL || tool.name == SKIP_FUNCTION || !is_identifier(&tool.name) {
            continue;
        }
        let description = if tool.description.trim().is_empty() {
            "No description."
        } else {
            tool.description.trim()
        };
        out.push_str(&format!(
            "    def {}({}) -> str:\n        \"\"\"{}\"\"\"\n        ...\n\n",
            tool.name,
            signature(&tool.parameters),
            description.replace("\"\"\"", "\\\"\\\"\\\"")
        ));
    }
    out.push_str(&format!(
        "    def {SKIP_FUNCTION}() -> str:\n        \"\"\"End this turn without replying.\"\"\"\n        ...\n"
    ));
    out.trim_end().to_string()
}

/// Python parameter list for a JSON Schema object: required first, then optional.
fn signature(schema: &Value) -> String {
    let (required, optional) = parameter_names(schema);
    let properties = schema.get("properties");
    let type_of = |name: &str| {
        properties
            .and_then(|p| p.get(name))
            .map(python_type)
            .unwrap_or_else(|| "Any".to_string())
    };

    let mut params: Vec<String> = required
        .iter()
        .filter(|n| is_identifier(n))
        .map(|n| format!("{n}: {}", type_of(n)))
        .collect();
    params.extend(
        optional
            .iter()
            .filter(|n| is_identifier(n))
            .map(|n| format!("{n}: {} | None = None", type_of(n))),
    );
    params.join(", ")
}

/// Parameter names of a tool schema, split into required and optional.
///
/// Required names follow the schema's `required` list; optional names follow
/// property order.
pub fn parameter_names(schema: &Value) -> (Vec<String>, Vec<String>) {
    let properties = schema.get("properties").and_then(Value::as_object);
    let required: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .filter(|n| properties.is_none_or(|p| p.contains_key(*n)))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let optional = properties
        .map(|p| {
            p.keys()
                .filter(|k| !required.contains(k))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    (required, optional)
}

/// Map a JSON Schema node to a Python type annotation.
pub fn python_type(schema: &Value) -> String {
    for key in ["anyOf", "oneOf"] {
        if let Some(variants) = schema.get(key).and_then(Value::as_array) {
            return union(variants.iter().map(python_type));
        }
    }

    match schema.get("type") {
        Some(Value::String(t)) => primitive(t, schema),
        Some(Value::Array(types)) => union(
            types
                .iter()
                .filter_map(Value::as_str)
                .map(|t| primitive(t, schema)),
        ),
        _ => "Any".into(),
    }
}

fn primitive(name: &str, schema: &Value) -> String {
    match name {
        "string" => "str".into(),
        "integer" => "int".into(),
        "number" => "float".into(),
        "boolean" => "bool".into(),
        "null" => "None".into(),
        "array" => {
            let items = schema
                .get("items")
                .map(python_type)
                .unwrap_or_else(|| "Any".into());
            format!("list[{items}]")
        }
        "object" => "dict[str, Any]".into(),
        _ => "Any".into(),
    }
}

fn union(types: impl Iterator<Item = String>) -> String {
    let mut seen: Vec<String> = Vec::new();
    for t in types {
        if !seen.contains(&t) {
            seen.push(t);
        }
    }
    if seen.is_empty() {
        "Any".into()
    } else {
        seen.join(" | ")
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
