//! Normalized stream events.
//!
//! NDJSON endpoints and exec transports both surface progress as a stream of
//! loosely-shaped JSON objects. [`StreamEvent`] is the tolerant decoding of
//! one such object: the fields this client understands are typed, everything
//! else lands in `extra`, and the original value is retained in `raw` so
//! nothing is lost to forward-compatibility.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded stream event. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event type, e.g. `info`, `complete`, `error`, `exit`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Event payload; servers send both strings and objects here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, alias = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_files: Option<Vec<String>>,
    /// Fields this client does not model, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// The original JSON value this event was decoded from.
    #[serde(skip)]
    pub raw: Value,
}

impl StreamEvent {
    /// Decode a parsed JSON value into an event. Total: values that are not
    /// objects, or objects whose fields have unusable types, become
    /// synthetic `error` events instead of failures.
    pub fn from_value(value: Value) -> StreamEvent {
        if !value.is_object() {
            return Self::synthetic_error("expected JSON object", value, None);
        }
        match serde_json::from_value::<StreamEvent>(value.clone()) {
            Ok(mut event) => {
                event.raw = value;
                event
            }
            Err(err) => Self::synthetic_error("invalid event shape", value, Some(err.to_string())),
        }
    }

    /// Synthetic event for a line that was not valid JSON at all.
    pub fn invalid_line(line: &str, reason: &str) -> StreamEvent {
        Self::synthetic_error(
            "invalid ndjson line",
            Value::String(line.to_owned()),
            Some(reason.to_owned()),
        )
    }

    /// Synthetic event for a caller-supplied parser that rejected an object.
    pub fn parser_failure(raw: Value, reason: &str) -> StreamEvent {
        Self::synthetic_error("event parser failed", raw, Some(reason.to_owned()))
    }

    /// True when this event reports an error (synthetic or server-sent).
    pub fn is_error(&self) -> bool {
        self.kind == "error"
    }

    fn synthetic_error(message: &str, raw: Value, reason: Option<String>) -> StreamEvent {
        let mut extra = Map::new();
        if let Some(reason) = reason {
            extra.insert("reason".to_owned(), Value::String(reason));
        }
        StreamEvent {
            kind: "error".to_owned(),
            message: Some(message.to_owned()),
            extra,
            raw,
            ..StreamEvent::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_typed_fields_and_keeps_extras() {
        let value = json!({
            "type": "complete",
            "data": "done",
            "exit_code": 0,
            "checkpoint_id": "cp-123"
        });
        let event = StreamEvent::from_value(value.clone());
        assert_eq!(event.kind, "complete");
        assert_eq!(event.data, Some(json!("done")));
        assert_eq!(event.exit_code, Some(0));
        assert_eq!(event.extra["checkpoint_id"], "cp-123");
        assert_eq!(event.raw, value);
    }

    #[test]
    fn exit_code_accepts_camel_case() {
        let event = StreamEvent::from_value(json!({"type": "exit", "exitCode": 9}));
        assert_eq!(event.exit_code, Some(9));
    }

    #[test]
    fn non_object_becomes_synthetic_error() {
        let event = StreamEvent::from_value(json!([1, 2, 3]));
        assert!(event.is_error());
        assert_eq!(event.message.as_deref(), Some("expected JSON object"));
        assert_eq!(event.raw, json!([1, 2, 3]));
    }

    #[test]
    fn invalid_line_keeps_line_and_reason() {
        let event = StreamEvent::invalid_line("{oops", "expected value at line 1");
        assert!(event.is_error());
        assert_eq!(event.raw, json!("{oops"));
        assert!(event.extra["reason"].as_str().unwrap().contains("expected"));
    }
}
