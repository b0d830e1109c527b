//! Helpers for building libSQL parameters.

use libsql::Value;

/// Nullable integer column value.
pub fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// Nullable text column value.
pub fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// `?, ?, ?` placeholder list for an `IN (...)` clause.
pub fn text_list_clause(len: usize) -> String {
    vec!["?"; len].join(", ")
}
