use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid variable pattern"))
}

/// Replace `{{name}}` tokens in `text` with values from `variables`.
///
/// Names are trimmed before lookup. Tokens naming an absent variable are
/// left verbatim. String variables are inserted raw, anything else as
/// compact JSON.
pub fn interpolate(text: &str, variables: &Map<String, Value>) -> String {
    variable_pattern()
        .replace_all(text, |caps: &Captures<'_>| {
            match variables.get(caps[1].trim()) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Interpolate a static input value. Only strings are touched.
pub fn interpolate_value(value: Value, variables: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) if !variables.is_empty() => Value::String(interpolate(&s, variables)),
        other => other,
    }
}
