//! The control-channel JSON envelope.
//!
//! On a shared control connection, text frames carrying the literal
//! `control:` prefix are channel-management messages; every other frame is
//! opaque payload for whichever operation currently holds the lease.
//!
//! Inbound messages are canonicalized at parse time: `op.complete` carries
//! its exit code under either `exitCode` or `exit_code` on the wire, and
//! `op.error` carries its message under either `error` or `message`. Both
//! spellings collapse into one representation here so no caller ever has to
//! look at the raw argument map.

use serde_json::{Map, Value, json};

/// Literal prefix distinguishing control frames from pass-through payload.
pub const CONTROL_PREFIX: &str = "control:";

/// Fallback message when an `op.error` arrives without one.
const DEFAULT_OP_ERROR: &str = "operation failed";

/// A canonicalized control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Start an operation on the leased connection.
    OpStart {
        /// Operation name, e.g. `exec`.
        op: String,
        /// Operation arguments, forwarded verbatim.
        args: Value,
    },
    /// Authoritative completion of the active operation.
    OpComplete { exit_code: i32 },
    /// Failure of the active operation.
    OpError { message: String },
}

impl ControlMessage {
    /// Parse a text frame.
    ///
    /// Returns `None` when the frame does not carry the `control:` prefix
    /// (it is payload, not a control message). A prefixed frame that is not
    /// a well-formed envelope yields `Some(Err(..))`.
    pub fn parse(text: &str) -> Option<Result<ControlMessage, serde_json::Error>> {
        let body = text.strip_prefix(CONTROL_PREFIX)?;
        Some(Self::parse_body(body))
    }

    fn parse_body(body: &str) -> Result<ControlMessage, serde_json::Error> {
        use serde::de::Error as _;

        let value: Value = serde_json::from_str(body)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("control frame missing \"type\""))?;

        let empty = Map::new();
        let args = value.get("args").and_then(Value::as_object).unwrap_or(&empty);

        match kind {
            "op.start" => Ok(ControlMessage::OpStart {
                op: value
                    .get("op")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                args: value.get("args").cloned().unwrap_or_else(|| json!({})),
            }),
            "op.complete" => Ok(ControlMessage::OpComplete {
                exit_code: first_i64(args, &["exitCode", "exit_code"]).unwrap_or(0) as i32,
            }),
            "op.error" => Ok(ControlMessage::OpError {
                message: first_str(args, &["error", "message"])
                    .unwrap_or(DEFAULT_OP_ERROR)
                    .to_owned(),
            }),
            other => Err(serde_json::Error::custom(format!(
                "unknown control frame type: {other}"
            ))),
        }
    }

    /// Encode as a prefixed text frame.
    pub fn encode(&self) -> String {
        let body = match self {
            ControlMessage::OpStart { op, args } => json!({
                "type": "op.start",
                "op": op,
                "args": args,
            }),
            ControlMessage::OpComplete { exit_code } => json!({
                "type": "op.complete",
                "args": { "exit_code": exit_code },
            }),
            ControlMessage::OpError { message } => json!({
                "type": "op.error",
                "args": { "error": message },
            }),
        };
        format!("{CONTROL_PREFIX}{body}")
    }
}

fn first_i64(args: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| args.get(*k).and_then(Value::as_i64))
}

fn first_str<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(Value::as_str))
}
