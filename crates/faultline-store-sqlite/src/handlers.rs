//! Per-event-type aggregation handlers.
//!
//! A handler runs inside the envelope's savepoint with the batch
//! transaction's connection; it never commits or rolls back itself.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use sqlx::SqliteConnection;

use faultline_store_core::StoreError;
use faultline_types::{Envelope, ExceptionPayload};

/// Aggregation logic for one `event_type`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Fold `envelope` into the store using `conn`.
    async fn handle(&self, conn: &mut SqliteConnection, envelope: &Envelope) -> Result<()>;
}

/// Decayed-recency score: `floor(ln(count) * 600 + unix(last_seen))`.
///
/// A first sighting scores the bare timestamp; `ln(1)` underflows nothing.
pub fn generate_score(count: i64, last_seen: NaiveDateTime) -> i64 {
    let decay = if count > 1 {
        (count as f64).ln() * 600.0
    } else {
        0.0
    };
    (decay + last_seen.and_utc().timestamp() as f64).floor() as i64
}

//─────────────────────────────
//  Exception handler
//─────────────────────────────

/// Handler for `Exception` and `HTTPException` envelopes.
///
/// Upserts the type and tag dictionaries, folds the envelope into its group
/// by `(type_id, hash)`, inserts the event row, and links the join tables.
#[derive(Debug, Default)]
pub struct ExceptionHandler;

#[async_trait]
impl EventHandler for ExceptionHandler {
    async fn handle(&self, conn: &mut SqliteConnection, envelope: &Envelope) -> Result<()> {
        let payload: ExceptionPayload = serde_json::from_value(envelope.data.clone())
            .map_err(|err| StoreError::MalformedEnvelope {
                event_type: envelope.event_type.clone(),
                reason: err.to_string(),
            })?;
        let date = envelope.date;

        let type_id = upsert_event_type(conn, &envelope.event_type).await?;

        let mut tag_ids = Vec::with_capacity(envelope.tags.len());
        for (name, value) in &envelope.tags {
            tag_ids.push(upsert_tag(conn, name, value).await?);
        }

        let (group_id, previous_count) =
            upsert_group(conn, type_id, &envelope.hash, &payload, date).await?;

        // Exactly one increment per envelope; the score sees the new count.
        let count = previous_count + 1;
        sqlx::query(r#"UPDATE "group" SET count = count + 1, last_seen = ?, score = ? WHERE id = ?"#)
            .bind(date)
            .bind(generate_score(count, date))
            .bind(group_id)
            .execute(&mut *conn)
            .await?;

        let blob = json!({
            "frames": envelope.data.get("frames").cloned().unwrap_or(Value::Null),
            "versions": envelope.data.get("versions").cloned().unwrap_or(Value::Null),
            "type": payload.type_name,
            "value": payload.value,
            "extra": Value::Object(envelope.extra.clone()),
            "traceback": payload.traceback,
        });

        sqlx::query(
            "INSERT INTO event (event_id, type_id, hash, datetime, time_spent, data) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&envelope.event_id)
        .bind(type_id)
        .bind(&envelope.hash)
        .bind(date)
        .bind(envelope.time_spent)
        .bind(faultline_wire::encode_blob(&blob)?)
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO group_events (group_id, event_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(&envelope.event_id)
            .execute(&mut *conn)
            .await?;

        for tag_id in tag_ids {
            sqlx::query("INSERT INTO event_tags (event_id, tag_id) VALUES (?, ?)")
                .bind(&envelope.event_id)
                .bind(tag_id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }
}

async fn upsert_event_type(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM event_type WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?
    {
        return Ok(id);
    }
    let result = sqlx::query("INSERT INTO event_type (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

async fn upsert_tag(conn: &mut SqliteConnection, name: &str, value: &str) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM tag WHERE name = ? AND value = ?")
            .bind(name)
            .bind(value)
            .fetch_optional(&mut *conn)
            .await?
    {
        return Ok(id);
    }
    let result = sqlx::query("INSERT INTO tag (name, value) VALUES (?, ?)")
        .bind(name)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Returns the group id and its count before this envelope.
async fn upsert_group(
    conn: &mut SqliteConnection,
    type_id: i64,
    hash: &str,
    payload: &ExceptionPayload,
    date: NaiveDateTime,
) -> Result<(i64, i64)> {
    if let Some((id, count)) = sqlx::query_as::<_, (i64, i64)>(
        r#"SELECT id, count FROM "group" WHERE type_id = ? AND hash = ?"#,
    )
    .bind(type_id)
    .bind(hash)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok((id, count));
    }
    let message = if payload.message.is_empty() {
        ExceptionPayload::summarize(&payload.type_name, &payload.value)
    } else {
        payload.message.clone()
    };
    let result = sqlx::query(
        r#"INSERT INTO "group" (type_id, hash, message, count, state, first_seen, last_seen, score)
           VALUES (?, ?, ?, 0, NULL, ?, ?, 0)"#,
    )
    .bind(type_id)
    .bind(hash)
    .bind(message)
    .bind(date)
    .bind(date)
    .execute(&mut *conn)
    .await?;
    Ok((result.last_insert_rowid(), 0))
}
