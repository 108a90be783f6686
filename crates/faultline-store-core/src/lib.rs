#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-store-core** – Core storage abstractions for Faultline.
//!
//! This crate defines the contract between the ingest side (recorder loop,
//! in-process dispatcher) and storage backends, without providing a concrete
//! implementation. Backends live in separate crates that depend on this
//! abstraction; `faultline-store-sqlite` is the reference driver.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use faultline_types::Envelope;

//─────────────────────────────
//  Event store contract
//─────────────────────────────

/// Sink for decoded envelopes with batched durability.
///
/// `message_received` folds one envelope into the in-progress batch;
/// `flush` makes the batch durable. Implementations serialize all mutations
/// behind one session - callers never observe partial envelopes.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fold one envelope into the open batch.
    ///
    /// Envelopes with an `event_type` no handler is registered for are
    /// ignored. Redelivery of an already-stored `event_id` is a silent
    /// no-op. Any other failure leaves the batch rolled back.
    async fn message_received(&self, envelope: Envelope) -> Result<()>;

    /// Commit everything received since the previous flush.
    ///
    /// A clean store flushes to nothing. A failed commit rolls the whole
    /// batch back before the error is returned.
    async fn flush(&self) -> Result<()>;
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Failures raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The envelope payload did not have the shape its `event_type` implies.
    #[error("malformed {event_type} envelope: {reason}")]
    MalformedEnvelope {
        /// The envelope's type tag.
        event_type: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The underlying database rejected an operation.
    #[error("database error: {0}")]
    Database(String),
}

//─────────────────────────────
//  Read models
//─────────────────────────────

/// One aggregation group: an equivalence class of events sharing a
/// fingerprint under one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Surrogate key.
    pub id: i64,
    /// Owning event type.
    pub type_id: i64,
    /// Grouping fingerprint.
    pub hash: String,
    /// One-line summary from the first sighting.
    pub message: String,
    /// Number of events folded into this group.
    pub count: i64,
    /// Forward-compatibility state marker; never written by ingest.
    pub state: Option<i64>,
    /// Timestamp of the earliest linked event.
    pub first_seen: NaiveDateTime,
    /// Timestamp of the latest committed event.
    pub last_seen: NaiveDateTime,
    /// Decayed-recency ordering score.
    pub score: i64,
}

/// One shared tag dictionary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    /// Surrogate key.
    pub id: i64,
    /// Tag name, e.g. `"Hostname"`.
    pub name: String,
    /// Tag value.
    pub value: String,
}

/// Identity and timestamp of one stored event, newest-first query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    /// The event's globally unique id.
    pub event_id: String,
    /// When the producer captured it.
    pub datetime: NaiveDateTime,
}
