//! Dot-path field loading from JSON payloads.
//!
//! Topic schemas are declared as tables of [`JsonField`]s whose `path` is a
//! case-sensitive, dot-separated key path into nested objects, e.g.
//! `"rpi-demo.rate-x"`.  [`load_fields`] resolves the whole table against a
//! payload and only succeeds when every field is present with the declared
//! type.

use serde_json::Value;
use tracing::debug;

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Float,
    Integer,
    Text,
}

/// One entry of a topic schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonField {
    pub path: &'static str,
    pub ty: FieldType,
}

impl JsonField {
    pub const fn float(path: &'static str) -> Self {
        Self {
            path,
            ty: FieldType::Float,
        }
    }

    pub const fn integer(path: &'static str) -> Self {
        Self {
            path,
            ty: FieldType::Integer,
        }
    }

    pub const fn text(path: &'static str) -> Self {
        Self {
            path,
            ty: FieldType::Text,
        }
    }
}

/// A loaded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Float(v) => *v,
            FieldValue::Integer(v) => *v as f64,
            FieldValue::Text(_) => 0.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            FieldValue::Float(v) => *v as i64,
            FieldValue::Integer(v) => *v,
            FieldValue::Text(_) => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Text(s) => s,
            _ => "",
        }
    }
}

/// Resolve a dot-separated key path inside `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, key| node.as_object()?.get(key))
}

fn load_one(root: &Value, field: &JsonField) -> Option<FieldValue> {
    let value = lookup(root, field.path)?;
    match field.ty {
        FieldType::Float => value.as_f64().map(FieldValue::Float),
        FieldType::Integer => value
            .as_i64()
            .or_else(|| value.as_f64().and_then(integral_f64))
            .map(FieldValue::Integer),
        FieldType::Text => value.as_str().map(|s| FieldValue::Text(s.to_string())),
    }
}

/// An `f64` holding a whole number inside the `i64` range.
fn integral_f64(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound.
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

/// Parse `payload` and load every field of `fields`, in table order.
///
/// # Errors
///
/// Returns a human-readable description when the payload is not JSON or
/// when fewer than all declared fields could be loaded.
pub fn load_fields(payload: &str, fields: &[JsonField]) -> Result<Vec<FieldValue>, String> {
    let root: Value =
        serde_json::from_str(payload).map_err(|e| format!("payload is not valid JSON: {e}"))?;

    let loaded: Vec<FieldValue> = fields
        .iter()
        .filter_map(|field| load_one(&root, field))
        .collect();
    debug!(loaded = loaded.len(), declared = fields.len(), "Loaded JSON data objects");

    if loaded.len() != fields.len() {
        return Err(format!(
            "payload contained {} of {} data objects",
            loaded.len(),
            fields.len()
        ));
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPI: [JsonField; 2] = [
        JsonField::float("rpi-demo.rate-x"),
        JsonField::integer("rpi-demo.lux"),
    ];

    #[test]
    fn nested_lookup() {
        let root: Value = serde_json::from_str(r#"{"a":{"b":{"c":7}}}"#).unwrap();
        assert_eq!(lookup(&root, "a.b.c"), Some(&Value::from(7)));
        assert!(lookup(&root, "a.B.c").is_none());
        assert!(lookup(&root, "a.b.c.d").is_none());
    }

    #[test]
    fn loads_all_fields_in_order() {
        let values = load_fields(r#"{"rpi-demo":{"lux": 456, "rate-x": 1.5}}"#, &RPI).unwrap();
        assert_eq!(values[0], FieldValue::Float(1.5));
        assert_eq!(values[1], FieldValue::Integer(456));
    }

    #[test]
    fn integer_field_accepts_float_literal() {
        let values = load_fields(r#"{"rpi-demo":{"rate-x": 1, "lux": 9.0}}"#, &RPI).unwrap();
        assert_eq!(values[0].as_f64(), 1.0);
        assert_eq!(values[1].as_i64(), 9);
    }

    #[test]
    fn integer_field_rejects_fractional_and_huge_floats() {
        for lux in ["9.5", "1e300", "-1e19"] {
            let payload = format!(r#"{{"rpi-demo":{{"rate-x": 1, "lux": {lux}}}}}"#);
            let err = load_fields(&payload, &RPI).unwrap_err();
            assert_eq!(err, "payload contained 1 of 2 data objects", "lux = {lux}");
        }
    }

    #[test]
    fn partial_payload_reports_counts() {
        let err = load_fields(r#"{"rpi-demo":{"rate-x": 1.0}}"#, &RPI).unwrap_err();
        assert_eq!(err, "payload contained 1 of 2 data objects");
    }

    #[test]
    fn wrong_type_is_not_loaded() {
        let err = load_fields(r#"{"rpi-demo":{"rate-x": "fast", "lux": 3}}"#, &RPI).unwrap_err();
        assert!(err.contains("1 of 2"));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = load_fields("{not json", &RPI).unwrap_err();
        assert!(err.starts_with("payload is not valid JSON"));
    }

    #[test]
    fn text_field() {
        let fields = [JsonField::text("command.data")];
        let values = load_fields(r#"{"command":{"data":"0a0b"}}"#, &fields).unwrap();
        assert_eq!(values[0].as_str(), "0a0b");
    }
}
