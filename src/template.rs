//! Mustache-style `{{path}}` substitution over JSON values.
//!
//! Only variable interpolation is supported: no sections, partials or
//! escaping. Paths are dotted (`output.short_history`, `input.messages.0`).

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Render `template` against `context`, leaving missing paths empty
pub fn render(template: &str, context: &Value) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            lookup_path(context, &caps[1])
                .map(|value| display_value(&value))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Resolve a dotted path inside a JSON value.
///
/// A string met mid-path is parsed as JSON and traversal continues inside
/// it, so structured model output stored as text stays addressable.
pub fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if let Value::String(text) = &current {
            current = serde_json::from_str(text).ok()?;
        }
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Strings render raw, everything else as compact JSON
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
