use thiserror::Error;

pub type JsonValue = serde_json::Value;

pub struct JsonConverter;

#[derive(Debug, Error)]
pub enum JsonValueConversionError {
    #[error("null cannot be used as a key")]
    NullKey,

    #[error("type is not supported as a key: {0}")]
    UnsupportedKeyType(&'static str),
}

impl JsonConverter {
    /// Renders a cell as a flat string field. Nulls become empty strings,
    /// nested values keep their JSON form.
    pub fn to_field(val: &JsonValue) -> String {
        match val {
            JsonValue::Null => String::new(),
            JsonValue::String(s) => s.clone(),
            JsonValue::Bool(b) => b.to_string(),
            JsonValue::Number(n) => n.to_string(),
            nested => nested.to_string(),
        }
    }

    /// Reads a field written by [`JsonConverter::to_field`] back. Empty
    /// strings become null and scalars that parse as JSON keep their type.
    pub fn from_field(raw: &str) -> JsonValue {
        if raw.is_empty() {
            return JsonValue::Null;
        }
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(value) if !value.is_string() => value,
            _ => JsonValue::String(raw.to_string()),
        }
    }

    pub fn to_key_part(val: &JsonValue) -> Result<String, JsonValueConversionError> {
        match val {
            JsonValue::Null => Err(JsonValueConversionError::NullKey),
            JsonValue::String(s) => Ok(s.clone()),
            JsonValue::Bool(b) => Ok(b.to_string()),
            JsonValue::Number(n) => Ok(n.to_string()),
            JsonValue::Array(_) => Err(JsonValueConversionError::UnsupportedKeyType("array")),
            JsonValue::Object(_) => Err(JsonValueConversionError::UnsupportedKeyType("object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fields() {
        assert_eq!(JsonConverter::to_field(&json!(null)), "");
        assert_eq!(JsonConverter::to_field(&json!("a")), "a");
        assert_eq!(JsonConverter::to_field(&json!(1.5)), "1.5");
        assert_eq!(JsonConverter::to_field(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn fields_read_back() {
        assert_eq!(JsonConverter::from_field(""), json!(null));
        assert_eq!(JsonConverter::from_field("42"), json!(42));
        assert_eq!(JsonConverter::from_field("false"), json!(false));
        assert_eq!(JsonConverter::from_field("[1,2]"), json!([1, 2]));
        assert_eq!(JsonConverter::from_field("new"), json!("new"));
        assert_eq!(JsonConverter::from_field("\"quoted\""), json!("\"quoted\""));
    }

    #[test]
    fn keys() {
        assert_eq!(JsonConverter::to_key_part(&json!(42)).unwrap(), "42");
        assert!(matches!(
            JsonConverter::to_key_part(&json!(null)),
            Err(JsonValueConversionError::NullKey)
        ));
        assert!(JsonConverter::to_key_part(&json!({"a": 1})).is_err());
    }
}
