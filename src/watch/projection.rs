use serde_json::Map;
use serde_json::Value;
use tracing::warn;

/// Keeps only the requested top level keys of a detail object.
///
/// Requested keys absent from the document come back as `null`. An empty
/// field list returns the document unchanged, as does any non-object detail.
pub fn project_fields(
    detail: Value,
    fields: &[String],
) -> Value {
    if fields.is_empty() {
        return detail;
    }
    match detail {
        Value::Object(mut doc) => {
            let mut projected = Map::with_capacity(fields.len());
            for field in fields {
                let value = doc.remove(field).unwrap_or(Value::Null);
                projected.insert(field.clone(), value);
            }
            Value::Object(projected)
        }
        other => other,
    }
}

/// The `detail` document of a cached event detail.
///
/// `None` when the cached value is not an event detail at all.
pub fn stored_detail(raw: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mut stored)) => Some(stored.remove("detail").unwrap_or(Value::Null)),
        Ok(other) => {
            warn!("cached event detail is not an object: {}", other);
            None
        }
        Err(e) => {
            warn!("cached event detail can not be parsed: {:?}", e);
            None
        }
    }
}
