#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-types** – Shared data model for the Faultline telemetry pipeline.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that both the producer-side capture path and the recorder-side
//! store can depend on it without cycles. It defines the envelope that flows
//! over the wire, the frame records inside exception payloads, the
//! canonicalization and truncation rules for captured runtime values, and
//! the grouping fingerprint both sides must agree on.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub mod fingerprint;
pub mod value;

pub use fingerprint::{fingerprint, render_traceback};
pub use value::{transform, shorten, Canonical, CapturedValue, SharedValue};

//─────────────────────────────
//  Severity levels
//─────────────────────────────

/// Default severity for captured exceptions.
pub const LEVEL_ERROR: i64 = 40;

/// Severity for warnings reported through the capture API.
pub const LEVEL_WARNING: i64 = 30;

//─────────────────────────────
//  Timestamp wire format
//─────────────────────────────

/// Wire format for envelope timestamps: ISO-8601 with microseconds and no
/// timezone suffix, e.g. `2026-08-01T12:34:56.123456`.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Serde adapter serializing [`NaiveDateTime`] in [`DATETIME_FORMAT`].
pub mod datetime_micros {
    use super::{NaiveDateTime, DATETIME_FORMAT};
    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a timestamp in the envelope wire format.
    pub fn serialize<S>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.format(DATETIME_FORMAT).to_string())
    }

    /// Parse a timestamp from the envelope wire format.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, DATETIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// `time_spent` is integer milliseconds on the wire, but some producers
/// historically reported a float duration. Accept both and truncate.
fn deserialize_time_spent<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("time_spent out of range")),
        Some(other) => Err(serde::de::Error::custom(format!(
            "time_spent must be a number or null, got {other}"
        ))),
    }
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// One serialized event unit flowing over the transport.
///
/// The same structure is produced by the capture API, carried zlib-deflated
/// over the wire, and decoded by the recorder before aggregation. Tag pairs
/// keep insertion order and may contain duplicates; `extra` keys unknown to
/// the store are preserved verbatim into storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event kind tag, e.g. `"Exception"`, `"HTTPException"`, `"Log"`.
    pub event_type: String,
    /// 32-char lowercase hex id, globally unique per event.
    pub event_id: String,
    /// Producer-local UTC wall clock at capture time.
    #[serde(with = "datetime_micros")]
    pub date: NaiveDateTime,
    /// Optional duration of the event in integer milliseconds.
    #[serde(default, deserialize_with = "deserialize_time_spent")]
    pub time_spent: Option<i64>,
    /// Grouping fingerprint, 32-char lowercase hex.
    pub hash: String,
    /// Ordered `(name, value)` pairs; duplicates allowed.
    pub tags: Vec<(String, String)>,
    /// Type-specific payload. For exceptions this is an [`ExceptionPayload`].
    pub data: Value,
    /// Free-form producer metadata.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Mint a new 32-char lowercase hex event id.
pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

//─────────────────────────────
//  Exception payload
//─────────────────────────────

/// The `data` payload carried by `Exception` and `HTTPException` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    /// Error type name, possibly namespaced with `::`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Stringified error value.
    #[serde(default)]
    pub value: String,
    /// One-line summary used as the group message, `"Type: value"`.
    #[serde(default)]
    pub message: String,
    /// Integer severity; defaults to [`LEVEL_ERROR`].
    #[serde(default = "default_level")]
    pub level: i64,
    /// Stack frames, outermost first.
    #[serde(default)]
    pub frames: Vec<Frame>,
    /// Preformatted traceback text ending with the `Type: value` line.
    #[serde(default)]
    pub traceback: String,
    /// Library name to version string for modules appearing in frames.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
}

fn default_level() -> i64 {
    LEVEL_ERROR
}

impl ExceptionPayload {
    /// One-line group summary for a type/value pair.
    pub fn summarize(type_name: &str, value: &str) -> String {
        if value.is_empty() {
            type_name.to_string()
        } else {
            format!("{type_name}: {value}")
        }
    }
}

//─────────────────────────────
//  Stack frames
//─────────────────────────────

/// One extracted stack frame, with canonicalized locals and source context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Opaque id, unique within the envelope.
    pub id: i64,
    /// Source file path as known to the producer.
    pub filename: String,
    /// Module path, `"?"` when unknown.
    pub module: String,
    /// Function name, `"?"` when unknown.
    pub function: String,
    /// 1-based source line number.
    pub lineno: u32,
    /// Canonicalized local variable snapshot.
    #[serde(default)]
    pub vars: Map<String, Value>,
    /// Source line at `lineno`, when the file was readable.
    #[serde(default)]
    pub context_line: Option<String>,
    /// Source lines in a ±5 window around `lineno`.
    #[serde(default)]
    pub with_context: Vec<String>,
    /// Outcome of the visibility pass.
    pub visible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_envelope() -> Envelope {
        Envelope {
            event_type: "Exception".to_string(),
            event_id: new_event_id(),
            date: NaiveDate::from_ymd_opt(2026, 8, 1)
                .unwrap()
                .and_hms_micro_opt(12, 30, 45, 123_456)
                .unwrap(),
            time_spent: Some(12),
            hash: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            tags: vec![
                ("Hostname".to_string(), "worker-3".to_string()),
                ("Hostname".to_string(), "worker-3".to_string()),
            ],
            data: serde_json::json!({"type": "ValueError", "value": "boom"}),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = sample_envelope();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_date_wire_format() {
        let envelope = sample_envelope();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["date"], "2026-08-01T12:30:45.123456");
    }

    #[test]
    fn test_time_spent_accepts_float() {
        let mut json = serde_json::to_value(sample_envelope()).unwrap();
        json["time_spent"] = serde_json::json!(18.7);
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.time_spent, Some(18));
    }

    #[test]
    fn test_time_spent_null() {
        let mut json = serde_json::to_value(sample_envelope()).unwrap();
        json["time_spent"] = Value::Null;
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.time_spent, None);
    }

    #[test]
    fn test_event_id_shape() {
        let id = new_event_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_payload_level_defaults_to_error() {
        let payload: ExceptionPayload =
            serde_json::from_value(serde_json::json!({"type": "KeyError"})).unwrap();
        assert_eq!(payload.level, LEVEL_ERROR);
    }

    #[test]
    fn test_summarize() {
        assert_eq!(
            ExceptionPayload::summarize("KeyError", "'no_name'"),
            "KeyError: 'no_name'"
        );
        assert_eq!(ExceptionPayload::summarize("StackOverflow", ""), "StackOverflow");
    }
}
