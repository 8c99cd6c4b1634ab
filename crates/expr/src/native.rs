// SPDX-License-Identifier: Apache-2.0

//! Narrowing of rendered string results into native values.

use serde_json::Value;

/// Coerces a rendered string to the narrowest native value it spells.
///
/// Integer, float, boolean, null, array and object literals become the
/// corresponding native value; everything else stays a string. Strings that
/// read as a complex-number literal (a numeric body with a `j`/`J` tail) are
/// deliberately kept as strings: downstream consumers have no complex type
/// and the raw form is the only faithful representation.
pub(crate) fn coerce_native(rendered: &str) -> Value {
    let trimmed = rendered.trim();
    if trimmed.is_empty() || is_complex_literal(trimmed) {
        return Value::String(rendered.to_string());
    }
    match serde_json::from_str::<Value>(trimmed) {
        // A quoted string narrows to itself; keep the raw form instead.
        Ok(Value::String(_)) | Err(_) => Value::String(rendered.to_string()),
        Ok(value) => value,
    }
}

/// Converts an evaluated native value, narrowing string results.
pub(crate) fn narrow_value(value: Value) -> Value {
    match value {
        Value::String(s) => coerce_native(&s),
        other => other,
    }
}

fn is_complex_literal(s: &str) -> bool {
    let body = s
        .strip_suffix('j')
        .or_else(|| s.strip_suffix('J'))
        .unwrap_or("");
    !body.is_empty() && body.parse::<f64>().is_ok()
}
