//! Structured API errors.
//!
//! Non-2xx responses (HTTP or upgrade handshakes) carry a JSON body of the
//! shape `{"error": <code>, "message": <text>, ...}`, sometimes with
//! rate-limit metadata attached. Parsing is total: an opaque or empty body
//! degrades to a status-coded error with the body text as its message.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A non-2xx API response, decoded as far as the body allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: u16,
    /// Human-readable message; falls back to the raw body, then the status.
    pub message: String,
    /// Machine-readable error code when the body carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Rate-limit metadata when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Unmodeled body fields, preserved as-is.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Rate-limit metadata attached to throttling errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
}

impl ApiError {
    /// Build an error from a status code alone.
    pub fn from_status(status: u16) -> ApiError {
        ApiError {
            status,
            message: format!("request failed with status {status}"),
            code: None,
            rate_limit: None,
            extra: Map::new(),
        }
    }

    /// Decode a response body. Never fails: bodies that are not the
    /// structured error shape degrade to status + body text.
    pub fn from_body(status: u16, body: &[u8]) -> ApiError {
        let text = String::from_utf8_lossy(body);
        let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(&text) else {
            let mut err = Self::from_status(status);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                err.message = trimmed.to_owned();
            }
            return err;
        };

        let code = obj
            .get("error")
            .or_else(|| obj.get("code"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| code.clone())
            .unwrap_or_else(|| format!("request failed with status {status}"));
        let rate_limit = obj
            .remove("rate_limit")
            .and_then(|v| serde_json::from_value(v).ok());

        obj.remove("error");
        obj.remove("code");
        obj.remove("message");

        ApiError {
            status,
            message,
            code,
            rate_limit,
            extra: obj,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({}, status {})", self.message, code, self.status),
            None => write!(f, "{} (status {})", self.message, self.status),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_structured_body() {
        let body = br#"{"error":"not_found","message":"missing"}"#;
        let err = ApiError::from_body(404, body);
        assert_eq!(err.status, 404);
        assert_eq!(err.code.as_deref(), Some("not_found"));
        assert_eq!(err.message, "missing");
    }

    #[test]
    fn parses_rate_limit_metadata() {
        let body = json!({
            "error": "rate_limited",
            "message": "slow down",
            "rate_limit": {"limit": 10, "window": "1m", "retry_after": 2.5, "current": 11}
        });
        let err = ApiError::from_body(429, body.to_string().as_bytes());
        let rl = err.rate_limit.unwrap();
        assert_eq!(rl.limit, Some(10));
        assert_eq!(rl.window.as_deref(), Some("1m"));
        assert_eq!(rl.retry_after, Some(2.5));
        assert_eq!(rl.current, Some(11));
    }

    #[test]
    fn opaque_body_degrades_to_status_and_text() {
        let err = ApiError::from_body(502, b"bad gateway");
        assert_eq!(err.status, 502);
        assert_eq!(err.message, "bad gateway");
        assert_eq!(err.code, None);
    }

    #[test]
    fn empty_body_degrades_to_status_only() {
        let err = ApiError::from_body(500, b"");
        assert_eq!(err.status, 500);
        assert_eq!(err.message, "request failed with status 500");
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let body = br#"{"error":"conflict","message":"busy","sprite":"db-1"}"#;
        let err = ApiError::from_body(409, body);
        assert_eq!(err.extra["sprite"], "db-1");
    }

    #[test]
    fn message_falls_back_to_code() {
        let err = ApiError::from_body(403, br#"{"error":"forbidden"}"#);
        assert_eq!(err.message, "forbidden");
    }
}
