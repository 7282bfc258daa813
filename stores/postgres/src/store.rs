//! The [Store] handle and the low-level storage plumbing shared by the
//! append, link, read and delete paths: transactions, advisory locks,
//! row decoding and commit notifications.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use everlog::event::Recorded;
use everlog::notify::{Bus, Notification};
use everlog::stream::DeletedState;
use everlog::version::{Check, ConflictError, Version};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::listener;
use crate::schema::{Schema, SchemaError};
use crate::subscription::Registry;

/// An Event Store backed by PostgreSQL.
///
/// Cloning a [Store] is cheap: clones share the connection pool, the
/// notification listener and the subscription registry.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
    pub(crate) config: Arc<Config>,
    pub(crate) schema: Schema,
    pub(crate) bus: Bus,
    pub(crate) registry: Arc<Registry>,
    listener: Arc<ListenerGuard>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("schema", &self.schema.name())
            .finish_non_exhaustive()
    }
}

struct ListenerGuard(JoinHandle<()>);

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Store {
    /// Connects a Store on top of the given pool.
    ///
    /// Verifies that the schema selected by the [Config] is installed and
    /// up to date (see [`Schema::migrate`]), then starts the notification
    /// listener feeding the in-process [Bus].
    pub async fn connect(pool: PgPool, config: Config) -> Result<Self, SchemaError> {
        let schema = Schema::new(&config);
        schema.verify(&pool).await?;

        let bus = Bus::new(config.notification_buffer);
        let listener = listener::spawn(pool.clone(), schema.clone(), bus.clone());

        Ok(Self {
            pool,
            config: Arc::new(config),
            schema,
            bus,
            registry: Arc::new(Registry::default()),
            listener: Arc::new(ListenerGuard(listener)),
        })
    }

    /// The in-process notification [Bus] fed by this Store.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Stops the notification listener. Subscriptions still attached fall
    /// back to polling until their handles are dropped.
    pub fn close(&self) {
        self.listener.0.abort();
    }
}

/// The `streams` row backing a Stream, as observed inside a transaction.
#[derive(Debug, Clone)]
pub(crate) struct StreamRow {
    pub id: i64,
    pub version: Version,
    pub deleted: DeletedState,
}

fn deleted_state_from_column(value: &str) -> Result<DeletedState, sqlx::Error> {
    match value {
        "live" => Ok(DeletedState::Live),
        "soft_deleted" => Ok(DeletedState::SoftDeleted),
        "hard_deleted" => Ok(DeletedState::HardDeleted),
        other => Err(sqlx::Error::Decode(
            format!("unknown deleted_state value: {other}").into(),
        )),
    }
}

/// Loads the `streams` row for the given Stream id, if any.
pub(crate) async fn stream_row<'e, E>(
    executor: E,
    schema: &Schema,
    stream_id: &str,
) -> Result<Option<StreamRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "SELECT id, stream_version, deleted_state FROM {} WHERE stream_id = $1",
        schema.table("streams"),
    ))
    .bind(stream_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| {
        let id: i64 = row.try_get("id")?;
        let version: i64 = row.try_get("stream_version")?;
        let deleted_state: String = row.try_get("deleted_state")?;

        Ok(StreamRow {
            id,
            version: version as Version,
            deleted: deleted_state_from_column(&deleted_state)?,
        })
    })
    .transpose()
}

/// Serializes writers to a single Stream for the rest of the transaction.
pub(crate) async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
    stream_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(schema.stream_lock_key(stream_id))
        .execute(&mut **tx)
        .await
        .map(|_| ())
}

/// Serializes global-sequence reservation across appenders until commit,
/// so sequence order equals commit order and reserved ranges stay
/// contiguous.
pub(crate) async fn lock_log(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(schema.log_lock_key())
        .execute(&mut **tx)
        .await
        .map(|_| ())
}

/// Error produced by the shared expected-version write protocol.
#[derive(Debug)]
pub(crate) enum WriteStreamError {
    Conflict(ConflictError),
    StreamDeleted,
    Database(sqlx::Error),
}

impl From<sqlx::Error> for WriteStreamError {
    fn from(error: sqlx::Error) -> Self {
        WriteStreamError::Database(error)
    }
}

/// A hard-deleted Stream may be recreated from an empty state, but only
/// with a version expectation compatible with an empty Stream.
pub(crate) fn recreates(check: Check) -> bool {
    matches!(check, Check::Any | Check::NoStream | Check::MustBe(0))
}

/// Runs the expected-version protocol for a write (append or link) on the
/// given Stream, inside the caller's transaction and under the Stream's
/// advisory lock.
///
/// Returns the live `streams` row if one exists after validation. A
/// tombstoned Stream is reset in place when the expectation allows
/// recreation and the check is run against an absent Stream, since the
/// recreated Stream is semantically new; otherwise the write is rejected.
pub(crate) async fn writable_stream(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
    stream_id: &str,
    check: Check,
) -> Result<Option<StreamRow>, WriteStreamError> {
    let row = stream_row(&mut **tx, schema, stream_id).await?;

    let (row, observed) = match row {
        None => (None, None),
        Some(row) => match row.deleted {
            DeletedState::SoftDeleted => return Err(WriteStreamError::StreamDeleted),
            DeletedState::HardDeleted => {
                if !recreates(check) {
                    return Err(WriteStreamError::StreamDeleted);
                }

                sqlx::query(&format!(
                    "UPDATE {} SET stream_version = 0, deleted_state = 'live', created_at = now() WHERE id = $1",
                    schema.table("streams"),
                ))
                .bind(row.id)
                .execute(&mut **tx)
                .await?;

                let reset = StreamRow {
                    version: 0,
                    deleted: DeletedState::Live,
                    ..row
                };

                (Some(reset), None)
            },
            DeletedState::Live => {
                let version = row.version;
                (Some(row), Some(version))
            },
        },
    };

    check.verify(observed).map_err(WriteStreamError::Conflict)?;

    Ok(row)
}

/// Inserts a new `streams` row and returns its internal id.
pub(crate) async fn insert_stream(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
    stream_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(&format!(
        "INSERT INTO {} (stream_id) VALUES ($1) RETURNING id",
        schema.table("streams"),
    ))
    .bind(stream_id)
    .fetch_one(&mut **tx)
    .await
}

/// Bumps the version counter of a Stream.
pub(crate) async fn update_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
    id: i64,
    version: Version,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "UPDATE {} SET stream_version = $1 WHERE id = $2",
        schema.table("streams"),
    ))
    .bind(version as i64)
    .bind(id)
    .execute(&mut **tx)
    .await
    .map(|_| ())
}

/// Publishes the commit [Notification] on the store's channel, from
/// inside the committing transaction. The message is delivered to
/// listeners only when (and if) the transaction commits.
pub(crate) async fn notify(
    tx: &mut Transaction<'_, Postgres>,
    schema: &Schema,
    notification: &Notification,
) -> Result<(), anyhow::Error> {
    let payload = serde_json::to_string(notification)
        .map_err(|error| anyhow!("failed to encode commit notification: {error}"))?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(schema.channel())
        .bind(payload)
        .execute(&mut **tx)
        .await
        .map_err(|error| anyhow!("failed to publish commit notification: {error}"))?;

    Ok(())
}

/// Column list shared by every query decoding Event rows through
/// [`positioned_from_row`]. Expects `e` to alias the events table and `s`
/// the streams table of the Event's original Stream.
pub(crate) const EVENT_COLUMNS: &str = r"e.event_id, s.stream_id AS stream_name, e.stream_version,
       e.event_type, e.data, e.metadata, e.causation_id, e.correlation_id,
       e.sequence_number, e.recorded_at";

/// An Event row paired with its position in the Stream it was read
/// through, which differs from the Event's original version when the
/// Event was linked.
#[derive(Debug, Clone)]
pub(crate) struct Positioned {
    pub position: u64,
    pub event: Recorded,
}

fn try_get_column<'r, T>(row: &'r PgRow, name: &'static str) -> Result<T, anyhow::Error>
where
    T: sqlx::Type<Postgres> + sqlx::Decode<'r, Postgres>,
{
    row.try_get(name)
        .map_err(|error| anyhow!("failed to get column '{name}' from result row: {error}"))
}

/// Decodes an Event row produced by the read queries, which alias the
/// original Stream's name as `stream_name` and the read position as
/// `position`.
pub(crate) fn positioned_from_row(row: &PgRow) -> Result<Positioned, anyhow::Error> {
    let position: i64 = try_get_column(row, "position")?;
    let event_id: Uuid = try_get_column(row, "event_id")?;
    let stream_name: String = try_get_column(row, "stream_name")?;
    let version: i64 = try_get_column(row, "stream_version")?;
    let event_type: String = try_get_column(row, "event_type")?;
    let data: Vec<u8> = try_get_column(row, "data")?;
    let metadata: Vec<u8> = try_get_column(row, "metadata")?;
    let causation_id: Option<Uuid> = try_get_column(row, "causation_id")?;
    let correlation_id: Option<Uuid> = try_get_column(row, "correlation_id")?;
    let sequence_number: i64 = try_get_column(row, "sequence_number")?;
    let recorded_at: DateTime<Utc> = try_get_column(row, "recorded_at")?;

    Ok(Positioned {
        position: position as u64,
        event: Recorded {
            event_id,
            stream_id: stream_name,
            version: version as Version,
            event_type,
            data,
            metadata,
            causation_id,
            correlation_id,
            sequence_number: sequence_number as u64,
            recorded_at,
        },
    })
}
