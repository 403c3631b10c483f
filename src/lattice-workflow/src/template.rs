//! `{{path.to.value}}` substitution against a workflow context.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("template regex pattern is valid")
});

/// Follow a dotted path through objects (and arrays, by index).
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a value inside an argument: strings verbatim, `null` empty,
/// everything else as JSON.
fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `{{path}}` in `template`. Missing paths become `""`.
pub fn substitute(template: &str, context: &Map<String, Value>) -> String {
    TEMPLATE_REGEX
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(context, &caps[1]).map(render_arg).unwrap_or_default()
        })
        .into_owned()
}

/// Substitute into every string of `value`, descending into arrays and
/// objects. Non-string scalars pass through.
pub fn substitute_value(value: &Value, context: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, context)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, context)).collect())
        }
        Value::Object(map) => Value::Object(substitute_args(map, context)),
        other => other.clone(),
    }
}

/// Substitute into every argument of a step.
pub fn substitute_args(
    args: &Map<String, Value>,
    context: &Map<String, Value>,
) -> Map<String, Value> {
    args.iter()
        .map(|(key, value)| (key.clone(), substitute_value(value, context)))
        .collect()
}

/// Prepare a condition for evaluation: strings are inserted verbatim, other
/// values as JSON and missing paths as `undefined`.
pub fn substitute_condition(condition: &str, context: &Map<String, Value>) -> String {
    TEMPLATE_REGEX
        .replace_all(condition, |caps: &Captures<'_>| match lookup(context, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "undefined".to_string(),
        })
        .into_owned()
}
