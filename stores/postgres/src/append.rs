//! The append engine: expected-version validation, Event id and position
//! assignment, global sequence reservation and the commit notification,
//! all within one advisory-locked transaction.

use anyhow::anyhow;
use async_trait::async_trait;
use everlog::event::Event;
use everlog::notify::{Notification, NotificationKind};
use everlog::store::{AppendError, Appender};
use everlog::stream::is_all;
use everlog::version::{Check, SequenceNumber, Version};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::store::{self, Store, WriteStreamError};

impl From<WriteStreamError> for AppendError {
    fn from(error: WriteStreamError) -> Self {
        match error {
            WriteStreamError::Conflict(conflict) => AppendError::Conflict(conflict),
            WriteStreamError::StreamDeleted => AppendError::StreamDeleted,
            WriteStreamError::Database(error) => {
                AppendError::Internal(anyhow!("db returned an error: {error}"))
            },
        }
    }
}

/// Reserves a contiguous range of global sequence numbers for a batch.
/// Callers must hold the global-log advisory lock, which keeps the range
/// contiguous and commit-ordered.
async fn reserve_sequence_range(
    tx: &mut Transaction<'_, Postgres>,
    store: &Store,
    count: usize,
) -> Result<(SequenceNumber, SequenceNumber), sqlx::Error> {
    let reserved: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT nextval('{}') FROM generate_series(1, $1)",
        store.schema.table("global_log_sequence"),
    ))
    .bind(count as i64)
    .fetch_all(&mut **tx)
    .await?;

    let from = reserved.first().copied().unwrap_or_default();
    let to = reserved.last().copied().unwrap_or_default();

    Ok((from as SequenceNumber, to as SequenceNumber))
}

impl Store {
    async fn append_in_tx(
        &self,
        stream_id: &str,
        check: Check,
        events: Vec<Event>,
    ) -> Result<Version, AppendError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| anyhow!("failed to begin transaction: {error}"))?;

        store::lock_stream(&mut tx, &self.schema, stream_id)
            .await
            .map_err(|error| anyhow!("failed to acquire stream lock: {error}"))?;

        let row = store::writable_stream(&mut tx, &self.schema, stream_id, check).await?;
        let current = row.as_ref().map_or(0, |row| row.version);

        // An empty batch runs the version check but records nothing, so
        // the validation-only transaction is discarded.
        if events.is_empty() {
            tx.rollback()
                .await
                .map_err(|error| anyhow!("failed to roll back transaction: {error}"))?;
            return Ok(current);
        }

        let internal_id = match row {
            Some(row) => row.id,
            None => store::insert_stream(&mut tx, &self.schema, stream_id)
                .await
                .map_err(|error| anyhow!("failed to create stream: {error}"))?,
        };

        store::lock_log(&mut tx, &self.schema)
            .await
            .map_err(|error| anyhow!("failed to acquire log lock: {error}"))?;

        let (from_sequence, to_sequence) = reserve_sequence_range(&mut tx, self, events.len())
            .await
            .map_err(|error| anyhow!("failed to reserve global sequence range: {error}"))?;

        let new_version = current + events.len() as Version;

        let insert_event = format!(
            r"INSERT INTO {} (event_id, stream_id, stream_version, event_type, data,
                              metadata, causation_id, correlation_id, sequence_number)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.schema.table("events"),
        );
        let insert_stream_event = format!(
            r"INSERT INTO {} (stream_id, stream_version, event_id,
                              original_stream_id, original_stream_version)
              VALUES ($1, $2, $3, $1, $2)",
            self.schema.table("stream_events"),
        );

        for (i, event) in events.into_iter().enumerate() {
            let event_id = event.id.unwrap_or_else(Uuid::new_v4);
            let version = current + (i as Version) + 1;
            let sequence_number = from_sequence + i as SequenceNumber;

            sqlx::query(&insert_event)
                .bind(event_id)
                .bind(internal_id)
                .bind(version as i64)
                .bind(&event.event_type)
                .bind(&event.data)
                .bind(&event.metadata)
                .bind(event.causation_id)
                .bind(event.correlation_id)
                .bind(sequence_number as i64)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to insert event {event_id}: {error}"))?;

            sqlx::query(&insert_stream_event)
                .bind(internal_id)
                .bind(version as i64)
                .bind(event_id)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to index event {event_id}: {error}"))?;
        }

        store::update_stream_version(&mut tx, &self.schema, internal_id, new_version)
            .await
            .map_err(|error| anyhow!("failed to update stream version: {error}"))?;

        store::notify(
            &mut tx,
            &self.schema,
            &Notification {
                stream_id: stream_id.to_owned(),
                from_version: current + 1,
                to_version: new_version,
                from_sequence,
                to_sequence,
                kind: NotificationKind::Appended,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|error| anyhow!("failed to commit transaction: {error}"))?;

        tracing::debug!(
            stream.id = %stream_id,
            stream.version = new_version,
            sequence.from = from_sequence,
            sequence.to = to_sequence,
            "events appended"
        );

        Ok(new_version)
    }
}

#[async_trait]
impl Appender for Store {
    async fn append(
        &self,
        stream_id: &str,
        check: Check,
        events: Vec<Event>,
    ) -> Result<Version, AppendError> {
        if is_all(stream_id) {
            return Err(AppendError::ReservedStream(stream_id.to_owned()));
        }

        tokio::time::timeout(
            self.config.append_timeout,
            self.append_in_tx(stream_id, check, events),
        )
        .await
        .map_err(|_| {
            AppendError::Internal(anyhow!(
                "append timed out after {:?}",
                self.config.append_timeout
            ))
        })?
    }
}
