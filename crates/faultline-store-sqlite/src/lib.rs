#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **faultline-store-sqlite** – SQLite aggregation engine for Faultline.
//!
//! Decoded envelopes are folded into the relational store: the tag and
//! event-type dictionaries are upserted, the envelope's group is found (or
//! created) by `(type_id, hash)`, its count, score, and last-seen advance,
//! and the event row is inserted and linked. All mutations between two
//! `flush` calls share one transaction; each envelope runs under its own
//! savepoint so a redelivered event id skips silently without poisoning the
//! batch.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Acquire, Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use faultline_store_core::{EventStore, EventSummary, GroupRecord, TagRecord};
use faultline_types::Envelope;

mod handlers;
mod schema;

pub use handlers::{generate_score, EventHandler, ExceptionHandler};

//─────────────────────────────
//  SQLite store
//─────────────────────────────

/// The SQLite-backed aggregation store.
///
/// The pool is pinned to a single connection: the ingest loop owns the only
/// database session, so the engine needs no internal locking beyond the
/// cell holding the open batch transaction. Read queries run against
/// committed state and should be issued between flushes.
pub struct SqliteStore {
    pool: SqlitePool,
    session: Mutex<Option<Transaction<'static, Sqlite>>>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database file and run the idempotent migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = Self::pool_options().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Open a database that lives only in memory. Used by tests and the
    /// in-process dispatcher sink.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = Self::pool_options().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool. The pool must be pinned to one
    /// connection; the batch transaction otherwise migrates between
    /// sessions.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::migrate(&pool).await?;

        let exception: Arc<dyn EventHandler> = Arc::new(ExceptionHandler);
        let mut handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
        handlers.insert("Exception".to_string(), Arc::clone(&exception));
        handlers.insert("HTTPException".to_string(), exception);

        Ok(Self {
            pool,
            session: Mutex::new(None),
            handlers,
        })
    }

    fn pool_options() -> SqlitePoolOptions {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    }

    /// Register an aggregation handler for an additional `event_type`.
    pub fn register_handler(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Close the underlying pool. Any uncommitted batch is discarded.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ingest(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        handler: &dyn EventHandler,
        envelope: &Envelope,
    ) -> Result<()> {
        let already = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM event WHERE event_id = ?")
            .bind(&envelope.event_id)
            .fetch_one(&mut **tx)
            .await?;
        if already > 0 {
            debug!(event_id = %envelope.event_id, "event redelivered, skipping");
            return Ok(());
        }

        let mut savepoint = tx.begin().await?;
        match handler.handle(&mut *savepoint, envelope).await {
            Ok(()) => Ok(savepoint.commit().await?),
            Err(err) => {
                let _ = savepoint.rollback().await;
                Err(err)
            }
        }
    }

    //─────────────────────────────
    //  Read queries
    //─────────────────────────────

    /// Groups ordered newest-seen first.
    pub async fn recently_seen(&self, limit: i64) -> Result<Vec<GroupRecord>> {
        let rows = sqlx::query(
            r#"SELECT id, type_id, hash, message, count, state, first_seen, last_seen, score
               FROM "group" ORDER BY last_seen DESC LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    /// The newest events linked to a group, newest first.
    pub async fn latest_events(&self, group_id: i64, limit: i64) -> Result<Vec<EventSummary>> {
        let rows = sqlx::query(
            "SELECT e.event_id, e.datetime FROM event e \
             JOIN group_events ge ON ge.event_id = e.event_id \
             WHERE ge.group_id = ? ORDER BY e.datetime DESC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| EventSummary {
                event_id: row.get("event_id"),
                datetime: row.get("datetime"),
            })
            .collect())
    }

    /// Distinct tags across all events linked to a group.
    pub async fn group_tags(&self, group_id: i64) -> Result<Vec<TagRecord>> {
        let rows = sqlx::query(
            "SELECT DISTINCT t.id, t.name, t.value FROM tag t \
             JOIN event_tags et ON et.tag_id = t.id \
             JOIN group_events ge ON ge.event_id = et.event_id \
             WHERE ge.group_id = ?",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| TagRecord {
                id: row.get("id"),
                name: row.get("name"),
                value: row.get("value"),
            })
            .collect())
    }

    /// The decoded `data` blob of one stored event.
    pub async fn event_data(&self, event_id: &str) -> Result<Option<Value>> {
        let armored = sqlx::query_scalar::<_, Option<String>>(
            "SELECT data FROM event WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        match armored.flatten() {
            Some(blob) => Ok(Some(faultline_wire::decode_blob(&blob)?)),
            None => Ok(None),
        }
    }

    /// Total number of committed event rows.
    pub async fn event_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM event")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Total number of groups.
    pub async fn group_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar(r#"SELECT COUNT(*) FROM "group""#)
            .fetch_one(&self.pool)
            .await?)
    }

    /// Number of events linked to a group through `group_events`.
    pub async fn linked_event_count(&self, group_id: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM group_events WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

fn group_from_row(row: &SqliteRow) -> Result<GroupRecord> {
    Ok(GroupRecord {
        id: row.try_get("id")?,
        type_id: row.try_get("type_id")?,
        hash: row.try_get("hash")?,
        message: row.try_get("message")?,
        count: row.try_get("count")?,
        state: row.try_get("state")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        score: row.try_get("score")?,
    })
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn message_received(&self, envelope: Envelope) -> Result<()> {
        let Some(handler) = self.handlers.get(&envelope.event_type) else {
            debug!(event_type = %envelope.event_type, "no handler registered, ignoring");
            return Ok(());
        };

        let mut session = self.session.lock().await;
        let mut tx = match session.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };

        match self.ingest(&mut tx, handler.as_ref(), &envelope).await {
            Ok(()) => {
                *session = Some(tx);
                Ok(())
            }
            Err(err) => {
                // Envelope failures beyond redelivery abandon the batch.
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(tx) = session.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}
