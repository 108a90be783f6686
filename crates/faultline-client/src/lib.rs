#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-client** – Producer-side capture path of the Faultline
//! pipeline.
//!
//! Two operations are exposed: [`Client::capture_exception`] turns a live
//! failure into a canonical envelope (frames, fingerprint, traceback,
//! versions), and [`Client::capture`] ships an arbitrary pre-built event.
//! Envelopes are routed by the [`Dispatcher`] to either a remote recorder
//! socket or an in-process store; remote sends are non-blocking and lossy
//! by contract, so reporting can never stall the producing process.

use chrono::{NaiveDateTime, Utc};
use serde_json::{Map, Value};

use faultline_types::{
    fingerprint, new_event_id, render_traceback, shorten, Envelope, ExceptionPayload, LEVEL_ERROR,
};

pub mod dispatch;
pub mod frames;
pub mod versions;

pub use dispatch::{Dispatcher, Sink};
pub use frames::{extract_frames, HideHint, RawFrame};
pub use versions::VersionRegistry;

// Re-exported for the `frame!` macro and for callers building locals.
pub use faultline_types::CapturedValue;

/// `data` keys shipped whole, exempt from truncation.
const UNSHORTENED_KEYS: &[&str] = &["traceback", "frames", "versions"];

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures surfaced to capture callers.
///
/// Everything downstream of a correctly configured client is best-effort
/// and silent; only misconfiguration and in-process store failures are
/// reported.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Neither a recorder address nor a store was configured.
    #[error("no recorder address or store configured")]
    Configuration,
    /// The event payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
    /// The in-process store rejected the event.
    #[error("store rejected the event: {0}")]
    Store(String),
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Process-wide capture configuration, passed in explicitly - there is no
/// hidden global state.
#[derive(Debug, Default)]
pub struct ClientConfig {
    /// Where envelopes go. `None` fails sends with a configuration error.
    pub sink: Option<Sink>,
    /// Tags appended to every captured event.
    pub tags: Vec<(String, String)>,
    /// Package versions reported alongside frames.
    pub versions: VersionRegistry,
}

impl ClientConfig {
    /// Configure shipping to a remote recorder.
    pub fn remote(addr: impl Into<String>) -> Self {
        Self {
            sink: Some(Sink::Remote(addr.into())),
            ..Self::default()
        }
    }

    /// Configure direct storage through an in-process store.
    pub fn store(store: std::sync::Arc<dyn faultline_store_core::EventStore>) -> Self {
        Self {
            sink: Some(Sink::Store(store)),
            ..Self::default()
        }
    }

    /// Add a process-wide tag.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    /// Record a package version for frame resolution.
    pub fn with_version(mut self, key: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(key, version);
        self
    }
}

//─────────────────────────────
//  Capture inputs
//─────────────────────────────

/// A failure as observed at the raise site.
#[derive(Debug)]
pub struct ExceptionInfo {
    /// Envelope type tag; `"Exception"` unless overridden.
    pub event_type: String,
    /// Error type name, possibly namespaced with `::`.
    pub type_name: String,
    /// Stringified error value.
    pub value: String,
    /// Integer severity.
    pub level: i64,
    /// Raw frames, outermost first.
    pub frames: Vec<RawFrame>,
    /// Extra tags for this event only.
    pub tags: Vec<(String, String)>,
    /// Free-form metadata.
    pub extra: Map<String, Value>,
}

impl ExceptionInfo {
    /// Describe a failure by type name and value.
    pub fn new(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            event_type: "Exception".to_string(),
            type_name: type_name.into(),
            value: value.into(),
            level: LEVEL_ERROR,
            frames: Vec::new(),
            tags: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Describe a failure from any error value, using its type path as the
    /// exception type.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }

    /// Override the envelope type tag, e.g. `"HTTPException"`.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Override the severity.
    pub fn with_level(mut self, level: i64) -> Self {
        self.level = level;
        self
    }

    /// Attach the captured stack, outermost first.
    pub fn with_frames(mut self, frames: Vec<RawFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Attach a per-event tag.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    /// Attach one metadata entry.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A pre-built event for [`Client::capture`]. Unset fields are filled with
/// defaults at capture time.
#[derive(Debug, Default)]
pub struct CaptureRequest {
    /// Envelope type tag.
    pub event_type: String,
    /// Type-specific payload.
    pub data: Value,
    /// Event timestamp; now (UTC) when unset.
    pub date: Option<NaiveDateTime>,
    /// Duration in integer milliseconds.
    pub time_spent: Option<i64>,
    /// Event id; minted when unset.
    pub event_id: Option<String>,
    /// Per-event tags.
    pub tags: Vec<(String, String)>,
    /// Free-form metadata.
    pub extra: Map<String, Value>,
    /// Grouping fingerprint. Events without one group under the empty hash.
    pub hash: Option<String>,
}

//─────────────────────────────
//  Client
//─────────────────────────────

/// Client-facing entry point of the capture path.
#[derive(Debug)]
pub struct Client {
    tags: Vec<(String, String)>,
    versions: VersionRegistry,
    dispatcher: Dispatcher,
}

impl Client {
    /// Build a client from its configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            tags: config.tags,
            versions: config.versions,
            dispatcher: Dispatcher::new(config.sink),
        }
    }

    /// Capture a failure: extract frames, fingerprint the stack, resolve
    /// versions, and ship the envelope. Returns the event id.
    pub async fn capture_exception(&self, info: ExceptionInfo) -> Result<String, CaptureError> {
        let frames = extract_frames(info.frames);
        let traceback = render_traceback(&frames, &info.type_name, &info.value);
        let message = ExceptionPayload::summarize(&info.type_name, &info.value);
        let hash = fingerprint(info.level, &info.type_name, &traceback, &message);
        let versions = self
            .versions
            .lookup_versions(frames.iter().map(|frame| frame.module.as_str()));

        let payload = ExceptionPayload {
            type_name: info.type_name,
            value: info.value,
            message,
            level: info.level,
            frames,
            traceback,
            versions,
        };

        self.capture(CaptureRequest {
            event_type: info.event_type,
            data: serde_json::to_value(&payload)?,
            tags: info.tags,
            extra: info.extra,
            hash: Some(hash),
            ..CaptureRequest::default()
        })
        .await
    }

    /// Capture a pre-built event and ship it. Returns the event id.
    pub async fn capture(&self, request: CaptureRequest) -> Result<String, CaptureError> {
        let event_id = request.event_id.unwrap_or_else(new_event_id);
        let date = request.date.unwrap_or_else(|| Utc::now().naive_utc());

        let mut tags = request.tags;
        tags.extend(self.tags.iter().cloned());
        tags.push((
            "Hostname".to_string(),
            gethostname::gethostname().to_string_lossy().into_owned(),
        ));

        let mut data = request.data;
        if data.is_null() {
            data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut data {
            for (key, value) in map.iter_mut() {
                if !UNSHORTENED_KEYS.contains(&key.as_str()) {
                    *value = shorten(value.take());
                }
            }
        }

        let mut extra = request.extra;
        for (_, value) in extra.iter_mut() {
            *value = shorten(value.take());
        }

        let envelope = Envelope {
            event_type: request.event_type,
            event_id: event_id.clone(),
            date,
            time_spent: request.time_spent,
            hash: request.hash.unwrap_or_default(),
            tags,
            data,
            extra,
        };
        self.dispatcher.send(envelope).await?;
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    use faultline_store_core::EventStore;

    #[derive(Default)]
    struct MockStore {
        received: AsyncMutex<Vec<Envelope>>,
        flushes: AsyncMutex<usize>,
    }

    #[async_trait]
    impl EventStore for MockStore {
        async fn message_received(&self, envelope: Envelope) -> anyhow::Result<()> {
            self.received.lock().await.push(envelope);
            Ok(())
        }

        async fn flush(&self) -> anyhow::Result<()> {
            *self.flushes.lock().await += 1;
            Ok(())
        }
    }

    fn store_client() -> (Client, Arc<MockStore>) {
        let store = Arc::new(MockStore::default());
        let client = Client::new(
            ClientConfig::store(store.clone()).with_version("faultline_client", "0.1.0"),
        );
        (client, store)
    }

    #[tokio::test]
    async fn test_capture_exception_builds_canonical_envelope() {
        let (client, store) = store_client();

        let info = ExceptionInfo::new("KeyError", "'no_name'")
            .with_frames(vec![
                frame!("outer_caller"),
                frame!("test_capture_exception_builds_canonical_envelope", { key = "no_name" }),
            ]);
        let event_id = client.capture_exception(info).await.unwrap();

        let received = store.received.lock().await;
        assert_eq!(received.len(), 1);
        let envelope = &received[0];
        assert_eq!(envelope.event_type, "Exception");
        assert_eq!(envelope.event_id, event_id);
        assert_eq!(envelope.hash.len(), 32);

        let payload: ExceptionPayload =
            serde_json::from_value(envelope.data.clone()).unwrap();
        assert_eq!(payload.message, "KeyError: 'no_name'");
        assert_eq!(payload.level, LEVEL_ERROR);
        assert_eq!(payload.frames.len(), 2);
        let innermost = payload.frames.last().unwrap();
        assert_eq!(
            innermost.function,
            "test_capture_exception_builds_canonical_envelope"
        );
        assert!(innermost.visible);
        assert_eq!(innermost.vars["key"], "no_name");
        assert!(payload.traceback.ends_with("KeyError: 'no_name'\n"));
        assert_eq!(payload.versions["faultline_client"], "0.1.0");

        assert_eq!(*store.flushes.lock().await, 1);
    }

    #[tokio::test]
    async fn test_hostname_tag_is_appended_last() {
        let store = Arc::new(MockStore::default());
        let client = Client::new(
            ClientConfig::store(store.clone()).with_tag("Application", "billing"),
        );
        client
            .capture_exception(ExceptionInfo::new("ValueError", "bad").with_tag("Request", "r-1"))
            .await
            .unwrap();

        let received = store.received.lock().await;
        let tags = &received[0].tags;
        assert_eq!(tags[0], ("Request".to_string(), "r-1".to_string()));
        assert_eq!(tags[1], ("Application".to_string(), "billing".to_string()));
        assert_eq!(tags[2].0, "Hostname");
        assert!(!tags[2].1.is_empty());
    }

    #[tokio::test]
    async fn test_stable_hash_across_messages() {
        let (client, store) = store_client();
        client
            .capture_exception(ExceptionInfo::new("ValueError", "a"))
            .await
            .unwrap();
        client
            .capture_exception(ExceptionInfo::new("ValueError", "b"))
            .await
            .unwrap();
        client
            .capture_exception(ExceptionInfo::new("TypeError", "a"))
            .await
            .unwrap();

        let received = store.received.lock().await;
        assert_eq!(received[0].hash, received[1].hash);
        assert_ne!(received[0].hash, received[2].hash);
    }

    #[tokio::test]
    async fn test_extra_and_data_are_truncated() {
        let (client, store) = store_client();
        let mut extra = Map::new();
        extra.insert("note".to_string(), Value::String("y".repeat(10_000)));
        extra.insert(
            "items".to_string(),
            Value::Array((0..1_000).map(Value::from).collect()),
        );
        let info = ExceptionInfo::new("ValueError", "x");
        client
            .capture_exception(ExceptionInfo { extra, ..info })
            .await
            .unwrap();

        let received = store.received.lock().await;
        let envelope = &received[0];
        let note = envelope.extra["note"].as_str().unwrap();
        assert_eq!(note.chars().count(), 258);
        assert_eq!(envelope.extra["items"].as_array().unwrap().len(), 22);
        // Exempt keys ship whole.
        assert!(envelope.data.get("traceback").is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_client_raises() {
        let client = Client::new(ClientConfig::default());
        let err = client
            .capture_exception(ExceptionInfo::new("ValueError", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Configuration));
    }

    #[tokio::test]
    async fn test_capture_mints_ids_and_dates() {
        let (client, store) = store_client();
        let id = client
            .capture(CaptureRequest {
                event_type: "Log".to_string(),
                data: serde_json::json!({"message": "disk is full"}),
                ..CaptureRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(id.len(), 32);

        let received = store.received.lock().await;
        assert_eq!(received[0].event_id, id);
        assert_eq!(received[0].hash, "");
    }

    #[tokio::test]
    async fn test_remote_sink_ships_frames() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = FramedRead::new(stream, faultline_wire::FrameCodec);
            framed.next().await.unwrap().unwrap()
        });

        let client = Client::new(ClientConfig::remote(addr));
        client
            .capture_exception(ExceptionInfo::new("ValueError", "remote"))
            .await
            .unwrap();

        let frame = accept.await.unwrap();
        let envelope = faultline_wire::decode(&frame).unwrap();
        assert_eq!(envelope.event_type, "Exception");
        let payload: ExceptionPayload = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(payload.value, "remote");
    }
}
