//! The linker: includes existing Events in other Streams by reference,
//! without copying payloads or assigning new global sequence numbers.

use anyhow::anyhow;
use async_trait::async_trait;
use everlog::notify::{Notification, NotificationKind};
use everlog::store::{LinkError, Linker};
use everlog::stream::is_all;
use everlog::version::{Check, SequenceNumber, Version};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{self, Store, WriteStreamError};

impl From<WriteStreamError> for LinkError {
    fn from(error: WriteStreamError) -> Self {
        match error {
            WriteStreamError::Conflict(conflict) => LinkError::Conflict(conflict),
            WriteStreamError::StreamDeleted => LinkError::StreamDeleted,
            WriteStreamError::Database(error) => {
                LinkError::Internal(anyhow!("db returned an error: {error}"))
            },
        }
    }
}

impl Store {
    async fn link_in_tx(
        &self,
        stream_id: &str,
        check: Check,
        event_ids: Vec<Uuid>,
    ) -> Result<Version, LinkError> {
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

        if event_ids.is_empty() {
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

        let select_event = format!(
            "SELECT stream_id, stream_version, sequence_number FROM {} WHERE event_id = $1",
            self.schema.table("events"),
        );
        let already_linked = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE stream_id = $1 AND event_id = $2)",
            self.schema.table("stream_events"),
        );
        let insert_link = format!(
            r"INSERT INTO {} (stream_id, stream_version, event_id,
                              original_stream_id, original_stream_version)
              VALUES ($1, $2, $3, $4, $5)",
            self.schema.table("stream_events"),
        );

        let mut new_version = current;
        let mut from_sequence = SequenceNumber::MAX;
        let mut to_sequence = 0;

        for event_id in event_ids {
            let event = sqlx::query(&select_event)
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to look up event {event_id}: {error}"))?
                .ok_or(LinkError::EventNotFound(event_id))?;

            let original_stream_id: i64 = event
                .try_get("stream_id")
                .map_err(|error| anyhow!("failed to get column 'stream_id': {error}"))?;
            let original_stream_version: i64 = event
                .try_get("stream_version")
                .map_err(|error| anyhow!("failed to get column 'stream_version': {error}"))?;
            let sequence_number: i64 = event
                .try_get("sequence_number")
                .map_err(|error| anyhow!("failed to get column 'sequence_number': {error}"))?;

            let duplicate: bool = sqlx::query_scalar(&already_linked)
                .bind(internal_id)
                .bind(event_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to check for an existing link: {error}"))?;

            if duplicate {
                return Err(LinkError::DuplicateLink {
                    event_id,
                    stream_id: stream_id.to_owned(),
                });
            }

            new_version += 1;
            from_sequence = from_sequence.min(sequence_number as SequenceNumber);
            to_sequence = to_sequence.max(sequence_number as SequenceNumber);

            sqlx::query(&insert_link)
                .bind(internal_id)
                .bind(new_version as i64)
                .bind(event_id)
                .bind(original_stream_id)
                .bind(original_stream_version)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to link event {event_id}: {error}"))?;
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
                kind: NotificationKind::Linked,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|error| anyhow!("failed to commit transaction: {error}"))?;

        tracing::debug!(
            stream.id = %stream_id,
            stream.version = new_version,
            "events linked"
        );

        Ok(new_version)
    }
}

#[async_trait]
impl Linker for Store {
    async fn link(
        &self,
        stream_id: &str,
        check: Check,
        event_ids: Vec<Uuid>,
    ) -> Result<Version, LinkError> {
        if is_all(stream_id) {
            return Err(LinkError::ReservedStream(stream_id.to_owned()));
        }

        tokio::time::timeout(
            self.config.append_timeout,
            self.link_in_tx(stream_id, check, event_ids),
        )
        .await
        .map_err(|_| {
            LinkError::Internal(anyhow!(
                "link timed out after {:?}",
                self.config.append_timeout
            ))
        })?
    }
}
