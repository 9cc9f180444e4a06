//! Accessors over schemaless JSON documents.
//!
//! Documents stay `serde_json::Value`; only the handful of fields needed for
//! cursor minting, dedup keys and scope matching are extracted.

use serde_json::Value;

/// Resolves a dotted path such as `detail.bk_host_id`.
pub fn get_path<'a>(
    doc: &'a Value,
    path: &str,
) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| cur.get(seg))
}

/// Integer field, accepting JSON numbers and numeric strings.
pub fn get_i64(
    doc: &Value,
    path: &str,
) -> Option<i64> {
    value_as_i64(get_path(doc, path)?)
}

pub fn get_str<'a>(
    doc: &'a Value,
    path: &str,
) -> Option<&'a str> {
    get_path(doc, path)?.as_str()
}

pub fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// String rendering used for enum comparisons (`"1"` and `1` compare equal).
pub fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Field present and not null.
pub fn has_field(
    doc: &Value,
    path: &str,
) -> bool {
    matches!(get_path(doc, path), Some(v) if !v.is_null())
}
