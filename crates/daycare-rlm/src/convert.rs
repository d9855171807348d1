//! Conversions between script values and tool calls.

use daycare_core::{Tool, ToolResult};
use serde_json::{Map, Value};

use crate::preamble::parameter_names;

/// Map a host call's positional and keyword arguments onto the tool's named
/// parameters. Positional arguments fill required parameters first, then
/// optional ones, in the order the preamble declares them.
pub fn args_convert(
    args: &[Value],
    kwargs: &Map<String, Value>,
    tool: &Tool,
) -> Result<Value, String> {
    let (required, optional) = parameter_names(&tool.parameters);
    let order: Vec<&String> = required.iter().chain(optional.iter()).collect();
    let declared = tool
        .parameters
        .get("properties")
        .and_then(Value::as_object)
        .is_some();

    if args.len() > order.len() {
        return Err(format!(
            "{}() takes {} positional argument(s) but {} were given",
            tool.name,
            order.len(),
            args.len()
        ));
    }

    let mut out = Map::new();
    for (name, value) in order.iter().zip(args) {
        out.insert((*name).clone(), value.clone());
    }
    for (name, value) in kwargs {
        if declared && !order.iter().any(|n| *n == name) {
            return Err(format!(
                "{}() got an unexpected keyword argument '{name}'",
                tool.name
            ));
        }
        if out.contains_key(name) {
            return Err(format!(
                "{}() got multiple values for argument '{name}'",
                tool.name
            ));
        }
        out.insert(name.clone(), value.clone());
    }

    if let Some(missing) = required.iter().find(|n| !out.contains_key(*n)) {
        return Err(format!(
            "{}() missing required argument: '{missing}'",
            tool.name
        ));
    }
    Ok(Value::Object(out))
}

/// The value a script sees as a tool's return value: the structured data when
/// the tool produced any, otherwise its text.
pub fn result_convert(result: &ToolResult) -> Value {
    match &result.data {
        Some(data) if !data.is_null() => data.clone(),
        _ => Value::String(result.content.clone()),
    }
}

/// Render a script value as text for the model.
///
/// `None` is empty, strings are raw, lists are comma-joined, and objects are JSON.
pub fn value_format(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(value_format).collect::<Vec<_>>().join(", "),
        Value::Object(_) => value.to_string(),
    }
}

/// One line of `print(...)` output.
pub fn print_line(values: &[Value]) -> String {
    values
        .iter()
        .map(value_format)
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}
