//! The deletion manager: soft (logical) and hard (physical) Stream
//! deletion, and their reconciliation with the global log.

use anyhow::anyhow;
use async_trait::async_trait;
use everlog::notify::{Notification, NotificationKind};
use everlog::store::{DeleteError, DeleteMode, Deleter};
use everlog::stream::{is_all, DeletedState};
use everlog::version::{Check, SequenceNumber};
use sqlx::{Postgres, Row, Transaction};

use crate::store::{self, Store};

impl Store {
    /// The global sequence range covered by a Stream's original Events,
    /// reported in deletion notifications.
    async fn sequence_range(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        internal_id: i64,
    ) -> Result<(SequenceNumber, SequenceNumber), sqlx::Error> {
        let row = sqlx::query(&format!(
            r"SELECT COALESCE(MIN(sequence_number), 0) AS from_sequence,
                     COALESCE(MAX(sequence_number), 0) AS to_sequence
              FROM {} WHERE stream_id = $1",
            self.schema.table("events"),
        ))
        .bind(internal_id)
        .fetch_one(&mut **tx)
        .await?;

        let from: i64 = row.try_get("from_sequence")?;
        let to: i64 = row.try_get("to_sequence")?;

        Ok((from as SequenceNumber, to as SequenceNumber))
    }

    async fn delete_in_tx(
        &self,
        stream_id: &str,
        check: Check,
        mode: DeleteMode,
    ) -> Result<(), DeleteError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| anyhow!("failed to begin transaction: {error}"))?;

        store::lock_stream(&mut tx, &self.schema, stream_id)
            .await
            .map_err(|error| anyhow!("failed to acquire stream lock: {error}"))?;

        let row = store::stream_row(&mut *tx, &self.schema, stream_id)
            .await
            .map_err(|error| anyhow!("db returned an error: {error}"))?
            .ok_or(DeleteError::StreamNotFound)?;

        match (row.deleted, mode) {
            (DeletedState::HardDeleted, _) => return Err(DeleteError::StreamDeleted),
            (DeletedState::SoftDeleted, DeleteMode::Soft) => {
                return Err(DeleteError::StreamDeleted)
            },
            // A soft-deleted stream can still be removed for good.
            (DeletedState::SoftDeleted | DeletedState::Live, _) => {},
        }

        check.verify(Some(row.version))?;

        let (from_sequence, to_sequence) = self
            .sequence_range(&mut tx, row.id)
            .await
            .map_err(|error| anyhow!("db returned an error: {error}"))?;

        let kind = match mode {
            DeleteMode::Soft => {
                sqlx::query(&format!(
                    "UPDATE {} SET deleted_state = 'soft_deleted' WHERE id = $1",
                    self.schema.table("streams"),
                ))
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to soft-delete stream: {error}"))?;

                NotificationKind::SoftDeleted
            },
            DeleteMode::Hard => {
                if !self.config.enable_hard_deletes {
                    return Err(DeleteError::HardDeletesDisabled);
                }

                // Links into this stream from elsewhere.
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE stream_id = $1",
                    self.schema.table("stream_events"),
                ))
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to remove stream index rows: {error}"))?;

                // The stream's own events; links to them in other streams
                // are removed by the cascade on stream_events.event_id.
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE stream_id = $1",
                    self.schema.table("events"),
                ))
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to remove stream events: {error}"))?;

                sqlx::query(&format!(
                    "UPDATE {} SET stream_version = 0, deleted_state = 'hard_deleted' WHERE id = $1",
                    self.schema.table("streams"),
                ))
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(|error| anyhow!("failed to record stream tombstone: {error}"))?;

                NotificationKind::HardDeleted
            },
        };

        store::notify(
            &mut tx,
            &self.schema,
            &Notification {
                stream_id: stream_id.to_owned(),
                from_version: 1,
                to_version: row.version,
                from_sequence,
                to_sequence,
                kind,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|error| anyhow!("failed to commit transaction: {error}"))?;

        tracing::debug!(
            stream.id = %stream_id,
            deletion.kind = ?kind,
            "stream deleted"
        );

        Ok(())
    }
}

#[async_trait]
impl Deleter for Store {
    async fn delete(
        &self,
        stream_id: &str,
        check: Check,
        mode: DeleteMode,
    ) -> Result<(), DeleteError> {
        if is_all(stream_id) {
            return Err(DeleteError::ReservedStream(stream_id.to_owned()));
        }

        tokio::time::timeout(
            self.config.append_timeout,
            self.delete_in_tx(stream_id, check, mode),
        )
        .await
        .map_err(|_| {
            DeleteError::Internal(anyhow!(
                "delete timed out after {:?}",
                self.config.append_timeout
            ))
        })?
    }
}
