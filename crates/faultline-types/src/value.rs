//! Canonicalization of captured runtime values.
//!
//! Producers snapshot local variables and exception values as a
//! [`CapturedValue`] graph. [`transform`] folds that graph into a JSON-safe
//! tree, substituting a sentinel on cycles so the walk stays total, and
//! [`shorten`] bounds the size of individual values before they are shipped.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

use crate::DATETIME_FORMAT;

/// Maximum stored string length before truncation.
pub const MAX_LENGTH_STRING: usize = 255;

/// Maximum stored sequence length before truncation.
pub const MAX_LENGTH_LIST: usize = 20;

/// Sentinel emitted when the canonicalizer revisits a node on the current path.
pub const RECURSION_SENTINEL: &str = "<...>";

/// Sentinel emitted for a scalar that cannot be encoded.
pub const DECODE_ERROR: &str = "(Error decoding value)";

//─────────────────────────────
//  Captured value graph
//─────────────────────────────

/// Hook for application types that know their own JSON-safe form.
///
/// Returning `None` defers to the type's `Debug` representation.
pub trait Canonical: fmt::Debug + Send + Sync {
    /// JSON-safe form of this value, already canonical.
    fn canonical(&self) -> Option<Value> {
        None
    }
}

/// An aliasable node in a captured value graph. Graphs built from `Shared`
/// nodes may contain cycles; the canonicalizer detects them by pointer
/// identity.
pub type SharedValue = Arc<RwLock<CapturedValue>>;

/// A snapshot of one runtime value, as captured at the raise site.
#[derive(Debug)]
pub enum CapturedValue {
    /// The null sentinel.
    Null,
    /// Boolean, passed through.
    Bool(bool),
    /// Signed integer, passed through.
    Int(i64),
    /// Floating point number. Non-finite values are unencodable in JSON.
    Float(f64),
    /// UTF-8 text, passed through.
    Text(String),
    /// Raw bytes; decoded lossily with replacement characters.
    Bytes(Vec<u8>),
    /// Wall-clock timestamp, rendered with microsecond precision.
    Timestamp(NaiveDateTime),
    /// Calendar date, rendered `YYYY-MM-DD`.
    Date(NaiveDate),
    /// UUID, rendered hyphenated.
    Uuid(uuid::Uuid),
    /// Ordered sequence.
    List(Vec<CapturedValue>),
    /// Key/value pairs. Non-text keys are coerced to their canonical string.
    Map(Vec<(CapturedValue, CapturedValue)>),
    /// Aliasable (possibly cyclic) node.
    Shared(SharedValue),
    /// Arbitrary application value with an optional canonical-form hook.
    Opaque(Box<dyn Canonical>),
}

impl From<&str> for CapturedValue {
    fn from(value: &str) -> Self {
        CapturedValue::Text(value.to_string())
    }
}

impl From<String> for CapturedValue {
    fn from(value: String) -> Self {
        CapturedValue::Text(value)
    }
}

impl From<i64> for CapturedValue {
    fn from(value: i64) -> Self {
        CapturedValue::Int(value)
    }
}

impl From<bool> for CapturedValue {
    fn from(value: bool) -> Self {
        CapturedValue::Bool(value)
    }
}

//─────────────────────────────
//  Canonicalization
//─────────────────────────────

/// Fold a captured value graph into a JSON-safe tree.
///
/// Total on arbitrary graphs: revisiting a [`CapturedValue::Shared`] node on
/// the current path yields [`RECURSION_SENTINEL`], and a scalar that cannot
/// be encoded yields [`DECODE_ERROR`]. Never panics or errors.
pub fn transform(value: &CapturedValue) -> Value {
    let mut visiting = HashSet::new();
    transform_inner(value, &mut visiting)
}

fn transform_inner(value: &CapturedValue, visiting: &mut HashSet<usize>) -> Value {
    match value {
        CapturedValue::Null => Value::Null,
        CapturedValue::Bool(b) => Value::Bool(*b),
        CapturedValue::Int(n) => Value::from(*n),
        CapturedValue::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) if f.is_finite() => Value::Number(n),
            _ => Value::String(DECODE_ERROR.to_string()),
        },
        CapturedValue::Text(s) => Value::String(s.clone()),
        CapturedValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        CapturedValue::Timestamp(ts) => Value::String(ts.format(DATETIME_FORMAT).to_string()),
        CapturedValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        CapturedValue::Uuid(u) => Value::String(u.to_string()),
        CapturedValue::List(items) => {
            Value::Array(items.iter().map(|v| transform_inner(v, visiting)).collect())
        }
        CapturedValue::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, val) in entries {
                object.insert(coerce_key(key, visiting), transform_inner(val, visiting));
            }
            Value::Object(object)
        }
        CapturedValue::Shared(cell) => {
            let identity = Arc::as_ptr(cell) as usize;
            if !visiting.insert(identity) {
                return Value::String(RECURSION_SENTINEL.to_string());
            }
            let result = match cell.read() {
                Ok(inner) => transform_inner(&inner, visiting),
                Err(_) => Value::String(DECODE_ERROR.to_string()),
            };
            visiting.remove(&identity);
            result
        }
        CapturedValue::Opaque(hook) => hook
            .canonical()
            .unwrap_or_else(|| Value::String(format!("{hook:?}"))),
    }
}

/// Object keys must be strings; anything else is stringified by its
/// canonical form.
fn coerce_key(key: &CapturedValue, visiting: &mut HashSet<usize>) -> String {
    match key {
        CapturedValue::Text(s) => s.clone(),
        other => match transform_inner(other, visiting) {
            Value::String(s) => s,
            rendered => rendered.to_string(),
        },
    }
}

//─────────────────────────────
//  Truncation
//─────────────────────────────

/// Bound the size of a single canonicalized value.
///
/// Strings longer than [`MAX_LENGTH_STRING`] characters keep their prefix
/// plus `"..."`; arrays longer than [`MAX_LENGTH_LIST`] keep their head plus
/// `"..."` and an element count. Objects are not truncated, and nested
/// values are left alone.
pub fn shorten(value: Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_LENGTH_STRING => {
            let prefix: String = s.chars().take(MAX_LENGTH_STRING).collect();
            Value::String(format!("{prefix}..."))
        }
        Value::Array(items) if items.len() > MAX_LENGTH_LIST => {
            let dropped = items.len() - MAX_LENGTH_LIST;
            let mut head: Vec<Value> = items.into_iter().take(MAX_LENGTH_LIST).collect();
            head.push(Value::String("...".to_string()));
            head.push(Value::String(format!("({dropped} more elements)")));
            Value::Array(head)
        }
        other => other,
    }
}
