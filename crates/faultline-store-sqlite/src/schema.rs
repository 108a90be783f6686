//! Table layout and indexes for the aggregation store.
//!
//! All statements are idempotent so opening an existing database is a no-op.
//! `group` is a reserved word in SQL and stays quoted everywhere.

use sqlx::SqlitePool;

pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_type (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event (
            event_id TEXT PRIMARY KEY,
            type_id INTEGER NOT NULL REFERENCES event_type(id) ON DELETE RESTRICT,
            hash TEXT NOT NULL,
            datetime TEXT NOT NULL,
            time_spent INTEGER,
            data TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS "group" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type_id INTEGER NOT NULL REFERENCES event_type(id) ON DELETE RESTRICT,
            hash TEXT NOT NULL,
            message TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            state INTEGER,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            score INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_tags (
            event_id TEXT NOT NULL REFERENCES event(event_id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE RESTRICT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_events (
            group_id INTEGER NOT NULL REFERENCES "group"(id) ON DELETE CASCADE,
            event_id TEXT NOT NULL REFERENCES event(event_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tag_name ON tag(name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_tag_name_value ON tag(name, value)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_hash ON event(hash)")
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_group_type_hash ON "group"(type_id, hash)"#)
        .execute(pool)
        .await?;
    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_group_last_seen ON "group"(last_seen DESC)"#)
        .execute(pool)
        .await?;

    Ok(())
}
