//! The reader: one-shot forward/backward reads of Streams and of the
//! global log, plus lazy paging streams restartable from any position.

use anyhow::anyhow;
use async_stream::try_stream;
use async_trait::async_trait;
use everlog::event::{Recorded, SequenceSelect, VersionSelect};
use everlog::store::{EventStream, ReadError, Streamer};
use everlog::stream::{is_all, Direction};

use crate::store::{self, Positioned, Store, EVENT_COLUMNS};

impl Store {
    /// Reads a page of a concrete Stream, pairing each Event with its
    /// position in the Stream it is read through.
    pub(crate) async fn read_stream_rows(
        &self,
        stream_id: &str,
        select: VersionSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Positioned>, ReadError> {
        if is_all(stream_id) {
            let select = match select {
                VersionSelect::All => SequenceSelect::All,
                VersionSelect::From(v) => SequenceSelect::From(v),
            };
            return self.read_all_rows(select, direction, limit).await;
        }

        let row = store::stream_row(&self.pool, &self.schema, stream_id)
            .await
            .map_err(|error| anyhow!("db returned an error: {error}"))?;

        let state = row.ok_or(ReadError::StreamNotFound)?;
        if state.deleted.is_deleted() {
            return Err(ReadError::StreamDeleted);
        }

        let (comparison, order, from) = match direction {
            Direction::Forward => {
                let from = match select {
                    VersionSelect::All => 1,
                    VersionSelect::From(v) => v,
                };
                (">=", "ASC", from)
            },
            Direction::Backward => {
                let from = match select {
                    VersionSelect::All => state.version,
                    VersionSelect::From(v) => v,
                };
                ("<=", "DESC", from)
            },
        };

        let query = format!(
            r"SELECT se.stream_version AS position, {EVENT_COLUMNS}
              FROM {stream_events} se
              JOIN {events} e ON e.event_id = se.event_id
              JOIN {streams} s ON s.id = e.stream_id
              WHERE se.stream_id = $1 AND se.stream_version {comparison} $2
              ORDER BY se.stream_version {order}
              LIMIT $3",
            stream_events = self.schema.table("stream_events"),
            events = self.schema.table("events"),
            streams = self.schema.table("streams"),
        );

        let rows = sqlx::query(&query)
            .bind(state.id)
            .bind(from as i64)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| anyhow!("db returned an error: {error}"))?;

        rows.iter()
            .map(|row| store::positioned_from_row(row).map_err(ReadError::Internal))
            .collect()
    }

    /// Reads a page of the global log. The position of each Event is its
    /// global sequence number.
    pub(crate) async fn read_all_rows(
        &self,
        select: SequenceSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Positioned>, ReadError> {
        let (comparison, order, from) = match direction {
            Direction::Forward => {
                let from = match select {
                    SequenceSelect::All => 1,
                    SequenceSelect::From(s) => s,
                };
                (">=", "ASC", from)
            },
            Direction::Backward => {
                let from = match select {
                    SequenceSelect::All => i64::MAX as u64,
                    SequenceSelect::From(s) => s,
                };
                ("<=", "DESC", from)
            },
        };

        let query = format!(
            r"SELECT e.sequence_number AS position, {EVENT_COLUMNS}
              FROM {events} e
              JOIN {streams} s ON s.id = e.stream_id
              WHERE e.sequence_number {comparison} $1
              ORDER BY e.sequence_number {order}
              LIMIT $2",
            events = self.schema.table("events"),
            streams = self.schema.table("streams"),
        );

        let rows = sqlx::query(&query)
            .bind(from.min(i64::MAX as u64) as i64)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| anyhow!("db returned an error: {error}"))?;

        rows.iter()
            .map(|row| store::positioned_from_row(row).map_err(ReadError::Internal))
            .collect()
    }
}

#[async_trait]
impl Streamer for Store {
    async fn read_stream(
        &self,
        stream_id: &str,
        select: VersionSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        let rows = tokio::time::timeout(
            self.config.read_timeout,
            self.read_stream_rows(stream_id, select, direction, limit),
        )
        .await
        .map_err(|_| {
            ReadError::Internal(anyhow!(
                "read timed out after {:?}",
                self.config.read_timeout
            ))
        })??;

        Ok(rows.into_iter().map(|row| row.event).collect())
    }

    async fn read_all(
        &self,
        select: SequenceSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        let rows = tokio::time::timeout(
            self.config.read_timeout,
            self.read_all_rows(select, direction, limit),
        )
        .await
        .map_err(|_| {
            ReadError::Internal(anyhow!(
                "read timed out after {:?}",
                self.config.read_timeout
            ))
        })??;

        Ok(rows.into_iter().map(|row| row.event).collect())
    }

    fn stream(&self, stream_id: &str, select: VersionSelect) -> EventStream {
        let store = self.clone();
        let stream_id = stream_id.to_owned();
        let batch = store.config.read_batch_size;

        Box::pin(try_stream! {
            let mut next = match select {
                VersionSelect::All => 1,
                VersionSelect::From(v) => v,
            };

            loop {
                let page = store
                    .read_stream_rows(
                        &stream_id,
                        VersionSelect::From(next),
                        Direction::Forward,
                        batch,
                    )
                    .await?;

                let full_page = page.len() == batch;

                for row in page {
                    next = row.position + 1;
                    yield row.event;
                }

                if !full_page {
                    break;
                }
            }
        })
    }

    fn stream_all(&self, select: SequenceSelect) -> EventStream {
        let store = self.clone();
        let batch = store.config.read_batch_size;

        Box::pin(try_stream! {
            let mut next = match select {
                SequenceSelect::All => 1,
                SequenceSelect::From(s) => s,
            };

            loop {
                let page = store
                    .read_all_rows(SequenceSelect::From(next), Direction::Forward, batch)
                    .await?;

                let full_page = page.len() == batch;

                for row in page {
                    next = row.position + 1;
                    yield row.event;
                }

                if !full_page {
                    break;
                }
            }
        })
    }
}
