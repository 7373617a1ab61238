//! Postgres-backed storage for the eventry aggregate store.
//!
//! [`Store`] implements [`eventry_core::storage::Storage`] and
//! [`eventry_core::storage::TrackingStorage`] on top of a [`PgPool`]. Events,
//! snapshots, the aggregate registry and the handler-state ledger all live in
//! the same database, so a business batch and its tracking rows commit in one
//! transaction.
//!
//! Timestamps are stored as nanoseconds since the Unix epoch (`BIGINT`);
//! payloads are opaque `BYTEA`.

mod classify;
mod storage;
mod tracking;

pub use storage::Tx;

use eventry_core::error::Error;
use sqlx::PgPool;

use crate::classify::classify;

/// A PostgreSQL-backed event and snapshot store.
///
/// The handle is a thin wrapper around a connection pool and is cheap to
/// clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the initial schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] when the database cannot be reached and
    /// [`Error::Internal`] for any other failed statement.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), Error> {
        // The unique constraint on (aggregate_kind, aggregate_id, revision)
        // carries optimistic concurrency: a stale writer's insert fails.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_events (
                id             BIGSERIAL PRIMARY KEY,
                event_id       UUID NOT NULL,
                event_kind     TEXT NOT NULL,
                aggregate_kind TEXT NOT NULL,
                aggregate_id   UUID NOT NULL,
                revision       BIGINT NOT NULL,
                created_at     BIGINT NOT NULL,
                data           BYTEA NOT NULL,
                UNIQUE (aggregate_kind, aggregate_id, revision)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_events"))?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS es_events_by_stream ON es_events(aggregate_kind, aggregate_id, created_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "index es_events"))?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS es_events_by_event_id ON es_events(event_id)")
            .execute(&self.pool)
            .await
            .map_err(|error| classify(error, "index es_events"))?;

        // One row per aggregate, written with its first event. `id` is the
        // keyset cursor for registry pagination.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_aggregates (
                id             BIGSERIAL PRIMARY KEY,
                aggregate_kind TEXT NOT NULL,
                aggregate_id   UUID NOT NULL,
                inserted_at    BIGINT NOT NULL,
                UNIQUE (aggregate_kind, aggregate_id)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_aggregates"))?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS es_aggregates_by_kind ON es_aggregates(aggregate_kind, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "index es_aggregates"))?;

        // Snapshots are append-only; readers take the newest row per
        // (aggregate, schema_version).
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_snapshots (
                id             BIGSERIAL PRIMARY KEY,
                aggregate_kind TEXT NOT NULL,
                aggregate_id   UUID NOT NULL,
                schema_version SMALLINT NOT NULL,
                revision       BIGINT NOT NULL,
                created_at     BIGINT NOT NULL,
                data           BYTEA NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_snapshots"))?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS es_snapshots_by_key ON es_snapshots(aggregate_kind, aggregate_id, schema_version, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "index es_snapshots"))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_handler_states (
                event_id     UUID NOT NULL,
                handler_name TEXT NOT NULL,
                state        TEXT NOT NULL,
                updated_at   BIGINT NOT NULL,
                PRIMARY KEY (event_id, handler_name)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_handler_states"))?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS es_handler_states_by_state ON es_handler_states(handler_name, state)",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "index es_handler_states"))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_handling_failures (
                id           BIGSERIAL PRIMARY KEY,
                event_id     UUID NOT NULL,
                handler_name TEXT NOT NULL,
                failed_at    BIGINT NOT NULL,
                message      TEXT NOT NULL,
                code         TEXT NOT NULL,
                retries      INT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_handling_failures"))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS es_handlers (
                handler_name TEXT NOT NULL,
                event_kind   TEXT NOT NULL,
                PRIMARY KEY (handler_name, event_kind)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|error| classify(error, "create es_handlers"))?;

        Ok(())
    }
}
