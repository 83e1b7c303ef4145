//! Keyword-argument payloads for RPC calls

use serde::ser::Error as _;
use serde::Serialize;
use serde_json::{Map, Value};

/// Keyword arguments passed to a remote method
pub type Kwargs = Map<String, Value>;

/// Convert a serializable value into keyword arguments
///
/// The value must serialize to a JSON object; its fields become the
/// method's named arguments.
pub fn to_kwargs<T: Serialize + ?Sized>(data: &T) -> Result<Kwargs, serde_json::Error> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        other => Err(serde_json::Error::custom(format!(
            "RPC payload must be a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct GetUser {
        id: u64,
        verbose: bool,
    }

    #[test]
    fn test_struct_becomes_kwargs() {
        let kwargs = to_kwargs(&GetUser { id: 7, verbose: true }).unwrap();
        assert_eq!(kwargs.get("id"), Some(&json!(7)));
        assert_eq!(kwargs.get("verbose"), Some(&json!(true)));
    }

    #[test]
    fn test_json_object_passes_through() {
        let kwargs = to_kwargs(&json!({"a": 1, "b": "two"})).unwrap();
        assert_eq!(Value::Object(kwargs), json!({"a": 1, "b": "two"}));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = to_kwargs(&json!([1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("got an array"));

        let err = to_kwargs("plain").unwrap_err();
        assert!(err.to_string().contains("got a string"));
    }
}
