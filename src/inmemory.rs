//! In-memory implementation of the [`Store`][crate::store::Store] traits,
//! backed by a thread-safe [`std::collections::HashMap`].
//!
//! Useful for unit tests and as a reference implementation of the
//! append/read protocol. It does not produce commit notifications and has
//! no durable subscriptions: those belong to the database-backed Stores.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::ready;
use futures::stream::{iter, once, StreamExt};
use uuid::Uuid;

use crate::event::{Event, Recorded, SequenceSelect, VersionSelect};
use crate::store::{
    AppendError, Appender, DeleteError, DeleteMode, Deleter, EventStream, LinkError, Linker,
    ReadError, Streamer,
};
use crate::stream::{is_all, DeletedState, Direction};
use crate::version::{Check, SequenceNumber, Version};

#[derive(Debug, Default)]
struct StreamState {
    version: Version,
    deleted: DeletedState,
    // (position in this stream, event id); positions stay fixed even when
    // link rows are removed by a hard deletion elsewhere.
    entries: Vec<(Version, Uuid)>,
}

#[derive(Debug)]
struct Backend {
    streams: HashMap<String, StreamState>,
    events: HashMap<Uuid, Recorded>,
    log: Vec<Uuid>,
    next_sequence: SequenceNumber,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            streams: HashMap::default(),
            events: HashMap::default(),
            log: Vec::default(),
            next_sequence: 1,
        }
    }
}

/// In-memory Event Store.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    enable_hard_deletes: bool,
    backend: Arc<RwLock<Backend>>,
}

impl InMemory {
    /// Enables hard deletions, which are rejected by default.
    #[must_use]
    pub fn with_hard_deletes(mut self) -> Self {
        self.enable_hard_deletes = true;
        self
    }
}

enum StateForWrite {
    Missing,
    Live(Version),
    SoftDeleted,
    Tombstone,
}

fn write_state(backend: &Backend, stream_id: &str) -> StateForWrite {
    match backend.streams.get(stream_id) {
        None => StateForWrite::Missing,
        Some(state) => match state.deleted {
            DeletedState::Live => StateForWrite::Live(state.version),
            DeletedState::SoftDeleted => StateForWrite::SoftDeleted,
            DeletedState::HardDeleted => StateForWrite::Tombstone,
        },
    }
}

/// A hard-deleted Stream may be recreated from an empty state, but only
/// with a version expectation compatible with an empty Stream.
fn recreates(check: Check) -> bool {
    matches!(check, Check::Any | Check::NoStream | Check::MustBe(0))
}

impl InMemory {
    fn read_stream_sync(
        &self,
        stream_id: &str,
        select: VersionSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        if is_all(stream_id) {
            let select = match select {
                VersionSelect::All => SequenceSelect::All,
                VersionSelect::From(v) => SequenceSelect::From(v),
            };
            return self.read_all_sync(select, direction, limit);
        }

        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let state = backend
            .streams
            .get(stream_id)
            .ok_or(ReadError::StreamNotFound)?;

        if state.deleted.is_deleted() {
            return Err(ReadError::StreamDeleted);
        }

        let resolve = |id: &Uuid| {
            backend
                .events
                .get(id)
                .cloned()
                .expect("stream entries reference recorded events")
        };

        let events = match direction {
            Direction::Forward => {
                let from = match select {
                    VersionSelect::All => 1,
                    VersionSelect::From(v) => v,
                };
                state
                    .entries
                    .iter()
                    .filter(|(position, _)| *position >= from)
                    .take(limit)
                    .map(|(_, id)| resolve(id))
                    .collect()
            },
            Direction::Backward => {
                let from = match select {
                    VersionSelect::All => state.version,
                    VersionSelect::From(v) => v,
                };
                state
                    .entries
                    .iter()
                    .rev()
                    .filter(|(position, _)| *position <= from)
                    .take(limit)
                    .map(|(_, id)| resolve(id))
                    .collect()
            },
        };

        Ok(events)
    }

    fn read_all_sync(
        &self,
        select: SequenceSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let resolve = |id: &Uuid| {
            backend
                .events
                .get(id)
                .cloned()
                .expect("the global log references recorded events")
        };

        let events = match direction {
            Direction::Forward => {
                let from = match select {
                    SequenceSelect::All => 1,
                    SequenceSelect::From(s) => s,
                };
                backend
                    .log
                    .iter()
                    .map(resolve)
                    .filter(|event| event.sequence_number >= from)
                    .take(limit)
                    .collect()
            },
            Direction::Backward => {
                let from = match select {
                    SequenceSelect::All => SequenceNumber::MAX,
                    SequenceSelect::From(s) => s,
                };
                backend
                    .log
                    .iter()
                    .rev()
                    .map(resolve)
                    .filter(|event| event.sequence_number <= from)
                    .take(limit)
                    .collect()
            },
        };

        Ok(events)
    }
}

#[async_trait]
impl Appender for InMemory {
    async fn append(
        &self,
        stream_id: &str,
        check: Check,
        events: Vec<Event>,
    ) -> Result<Version, AppendError> {
        if is_all(stream_id) {
            return Err(AppendError::ReservedStream(stream_id.to_owned()));
        }

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let current = match write_state(&backend, stream_id) {
            StateForWrite::SoftDeleted => return Err(AppendError::StreamDeleted),
            StateForWrite::Tombstone => {
                if !recreates(check) {
                    return Err(AppendError::StreamDeleted);
                }
                if !events.is_empty() {
                    backend
                        .streams
                        .insert(stream_id.to_owned(), StreamState::default());
                }
                None
            },
            StateForWrite::Missing => None,
            StateForWrite::Live(version) => Some(version),
        };

        check.verify(current)?;

        let current = current.unwrap_or(0);
        if events.is_empty() {
            return Ok(current);
        }

        let mut new_version = current;
        for event in events {
            let event_id = event.id.unwrap_or_else(Uuid::new_v4);
            if backend.events.contains_key(&event_id) {
                return Err(AppendError::Internal(anyhow::anyhow!(
                    "event id {event_id} is already recorded"
                )));
            }

            new_version += 1;
            let sequence_number = backend.next_sequence;
            backend.next_sequence += 1;

            backend.events.insert(
                event_id,
                Recorded {
                    event_id,
                    stream_id: stream_id.to_owned(),
                    version: new_version,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                    causation_id: event.causation_id,
                    correlation_id: event.correlation_id,
                    sequence_number,
                    recorded_at: Utc::now(),
                },
            );
            backend.log.push(event_id);

            let state = backend.streams.entry(stream_id.to_owned()).or_default();
            state.entries.push((new_version, event_id));
            state.version = new_version;
        }

        Ok(new_version)
    }
}

#[async_trait]
impl Linker for InMemory {
    async fn link(
        &self,
        stream_id: &str,
        check: Check,
        event_ids: Vec<Uuid>,
    ) -> Result<Version, LinkError> {
        if is_all(stream_id) {
            return Err(LinkError::ReservedStream(stream_id.to_owned()));
        }

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let current = match write_state(&backend, stream_id) {
            StateForWrite::SoftDeleted => return Err(LinkError::StreamDeleted),
            StateForWrite::Tombstone => {
                if !recreates(check) {
                    return Err(LinkError::StreamDeleted);
                }
                if !event_ids.is_empty() {
                    backend
                        .streams
                        .insert(stream_id.to_owned(), StreamState::default());
                }
                None
            },
            StateForWrite::Missing => None,
            StateForWrite::Live(version) => Some(version),
        };

        check.verify(current)?;

        let mut new_version = current.unwrap_or(0);
        for event_id in event_ids {
            if !backend.events.contains_key(&event_id) {
                return Err(LinkError::EventNotFound(event_id));
            }

            let already_linked = backend
                .streams
                .get(stream_id)
                .map(|state| state.entries.iter().any(|(_, id)| *id == event_id))
                .unwrap_or(false);

            if already_linked {
                return Err(LinkError::DuplicateLink {
                    event_id,
                    stream_id: stream_id.to_owned(),
                });
            }

            new_version += 1;
            let state = backend.streams.entry(stream_id.to_owned()).or_default();
            state.entries.push((new_version, event_id));
            state.version = new_version;
        }

        Ok(new_version)
    }
}

#[async_trait]
impl Streamer for InMemory {
    async fn read_stream(
        &self,
        stream_id: &str,
        select: VersionSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        self.read_stream_sync(stream_id, select, direction, limit)
    }

    async fn read_all(
        &self,
        select: SequenceSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError> {
        self.read_all_sync(select, direction, limit)
    }

    fn stream(&self, stream_id: &str, select: VersionSelect) -> EventStream {
        match self.read_stream_sync(stream_id, select, Direction::Forward, usize::MAX) {
            Ok(events) => iter(events).map(Ok).boxed(),
            Err(error) => once(ready(Err(error))).boxed(),
        }
    }

    fn stream_all(&self, select: SequenceSelect) -> EventStream {
        match self.read_all_sync(select, Direction::Forward, usize::MAX) {
            Ok(events) => iter(events).map(Ok).boxed(),
            Err(error) => once(ready(Err(error))).boxed(),
        }
    }
}

#[async_trait]
impl Deleter for InMemory {
    async fn delete(
        &self,
        stream_id: &str,
        check: Check,
        mode: DeleteMode,
    ) -> Result<(), DeleteError> {
        if is_all(stream_id) {
            return Err(DeleteError::ReservedStream(stream_id.to_owned()));
        }

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let state = backend
            .streams
            .get(stream_id)
            .ok_or(DeleteError::StreamNotFound)?;

        match (state.deleted, mode) {
            (DeletedState::HardDeleted, _) => return Err(DeleteError::StreamDeleted),
            (DeletedState::SoftDeleted, DeleteMode::Soft) => {
                return Err(DeleteError::StreamDeleted)
            },
            // A soft-deleted stream can still be removed for good.
            (DeletedState::SoftDeleted | DeletedState::Live, _) => {},
        }

        check.verify(Some(state.version))?;

        match mode {
            DeleteMode::Soft => {
                backend
                    .streams
                    .get_mut(stream_id)
                    .expect("stream state verified above")
                    .deleted = DeletedState::SoftDeleted;
            },
            DeleteMode::Hard => {
                if !self.enable_hard_deletes {
                    return Err(DeleteError::HardDeletesDisabled);
                }

                let originals: Vec<Uuid> = backend
                    .events
                    .values()
                    .filter(|event| event.stream_id == stream_id)
                    .map(|event| event.event_id)
                    .collect();

                for event_id in &originals {
                    backend.events.remove(event_id);
                }
                backend.log.retain(|id| !originals.contains(id));

                for state in backend.streams.values_mut() {
                    state.entries.retain(|(_, id)| !originals.contains(id));
                }

                let state = backend
                    .streams
                    .get_mut(stream_id)
                    .expect("stream state verified above");
                state.entries.clear();
                state.version = 0;
                state.deleted = DeletedState::HardDeleted;
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;

    use super::*;
    use crate::stream;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, format!(r#"{{"type":"{event_type}"}}"#).into_bytes())
    }

    #[tokio::test]
    async fn appended_events_are_read_back_in_order() {
        let store = InMemory::default();

        let new_version = store
            .append("orders:1", Check::MustBe(0), vec![event("created"), event("paid")])
            .await
            .expect("append should not fail");

        assert_eq!(new_version, 2);

        let events = store
            .read_stream("orders:1", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect("read should not fail");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);
        assert_eq!(events[0].event_type, "created");
        assert!(events[0].sequence_number < events[1].sequence_number);
    }

    #[tokio::test]
    async fn version_conflicts_are_detected() {
        let store = InMemory::default();

        store
            .append("orders:1", Check::MustBe(0), vec![event("created"), event("paid")])
            .await
            .expect("append should not fail");

        let error = store
            .append("orders:1", Check::MustBe(1), vec![event("shipped")])
            .await
            .expect_err("a stale expected version should be rejected");

        match error {
            AppendError::Conflict(conflict) => {
                assert_eq!(conflict.expected, Check::MustBe(1));
                assert_eq!(conflict.actual, 2);
            },
            other => panic!("expected a conflict error, received: {other}"),
        }
    }

    #[tokio::test]
    async fn no_stream_check_rejects_an_existing_stream() {
        let store = InMemory::default();

        store
            .append("orders:1", Check::NoStream, vec![event("created")])
            .await
            .expect("append should not fail");

        let error = store
            .append("orders:1", Check::NoStream, vec![event("created")])
            .await
            .expect_err("the stream already exists");

        assert!(matches!(error, AppendError::Conflict(_)));
    }

    #[tokio::test]
    async fn stream_exists_check_rejects_a_missing_stream() {
        let store = InMemory::default();

        let error = store
            .append("orders:1", Check::StreamExists, vec![event("created")])
            .await
            .expect_err("the stream does not exist yet");

        assert!(matches!(error, AppendError::Conflict(_)));
    }

    #[tokio::test]
    async fn an_empty_batch_validates_but_records_nothing() {
        let store = InMemory::default();

        let version = store
            .append("orders:1", Check::MustBe(0), vec![])
            .await
            .expect("an empty batch with a passing check should not fail");
        assert_eq!(version, 0);

        store
            .append("orders:1", Check::MustBe(3), vec![])
            .await
            .expect_err("an empty batch still runs the version check");

        // The empty batch did not create the stream.
        let error = store
            .read_stream("orders:1", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect_err("the stream should not exist");
        assert!(matches!(error, ReadError::StreamNotFound));
    }

    #[tokio::test]
    async fn the_global_log_orders_events_across_streams() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1"), event("e2")])
            .await
            .expect("append should not fail");
        store
            .append("s2", Check::MustBe(0), vec![event("e4")])
            .await
            .expect("append should not fail");

        let all = store
            .read_all(SequenceSelect::All, Direction::Forward, 10)
            .await
            .expect("reading the global log should not fail");

        let types: Vec<_> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["e1", "e2", "e4"]);

        let sequences: Vec<_> = all.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn linked_events_keep_their_original_identity() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1"), event("e2")])
            .await
            .expect("append should not fail");
        store
            .append("s2", Check::MustBe(0), vec![event("e4")])
            .await
            .expect("append should not fail");

        let e1 = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 1)
            .await
            .expect("read should not fail")
            .remove(0);

        let new_version = store
            .link("s2", Check::MustBe(1), vec![e1.event_id])
            .await
            .expect("linking should not fail");
        assert_eq!(new_version, 2);

        let events = store
            .read_stream("s2", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect("read should not fail");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "e4");
        assert_eq!(events[1].event_id, e1.event_id);
        assert_eq!(events[1].stream_id, "s");
        assert_eq!(events[1].version, 1);

        // Linking does not assign a new global sequence.
        assert_eq!(events[1].sequence_number, e1.sequence_number);

        // The global log contains the event once.
        let all = store
            .read_all(SequenceSelect::All, Direction::Forward, 10)
            .await
            .expect("reading the global log should not fail");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn linking_twice_into_the_same_stream_is_rejected() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1")])
            .await
            .expect("append should not fail");
        store
            .append("s2", Check::MustBe(0), vec![event("e4")])
            .await
            .expect("append should not fail");

        let e1 = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 1)
            .await
            .expect("read should not fail")
            .remove(0);

        store
            .link("s2", Check::MustBe(1), vec![e1.event_id])
            .await
            .expect("the first link should not fail");

        let error = store
            .link("s2", Check::MustBe(2), vec![e1.event_id])
            .await
            .expect_err("the second link should be rejected");

        assert!(matches!(error, LinkError::DuplicateLink { .. }));
    }

    #[tokio::test]
    async fn linking_an_unknown_event_is_rejected() {
        let store = InMemory::default();

        store
            .append("s2", Check::MustBe(0), vec![event("e4")])
            .await
            .expect("append should not fail");

        let unknown = Uuid::new_v4();
        let error = store
            .link("s2", Check::MustBe(1), vec![unknown])
            .await
            .expect_err("linking an unknown event should be rejected");

        assert!(matches!(error, LinkError::EventNotFound(id) if id == unknown));
    }

    #[tokio::test]
    async fn soft_deletion_hides_the_stream_but_not_the_global_log() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1")])
            .await
            .expect("append should not fail");
        store
            .delete("s", Check::MustBe(1), DeleteMode::Soft)
            .await
            .expect("soft deletion should not fail");

        let error = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect_err("direct reads of a soft-deleted stream fail");
        assert!(matches!(error, ReadError::StreamDeleted));

        let error = store
            .append("s", Check::Any, vec![event("e2")])
            .await
            .expect_err("appends to a soft-deleted stream fail");
        assert!(matches!(error, AppendError::StreamDeleted));

        let all = store
            .read_all(SequenceSelect::All, Direction::Forward, 10)
            .await
            .expect("reading the global log should not fail");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn hard_deletion_requires_the_configuration_opt_in() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1")])
            .await
            .expect("append should not fail");

        let error = store
            .delete("s", Check::Any, DeleteMode::Hard)
            .await
            .expect_err("hard deletions are disabled by default");

        assert!(matches!(error, DeleteError::HardDeletesDisabled));
    }

    #[tokio::test]
    async fn hard_deletion_removes_the_stream_its_events_and_their_links() {
        let store = InMemory::default().with_hard_deletes();

        store
            .append("s", Check::MustBe(0), vec![event("e1"), event("e2")])
            .await
            .expect("append should not fail");
        store
            .append("s2", Check::MustBe(0), vec![event("e4")])
            .await
            .expect("append should not fail");

        let e1 = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 1)
            .await
            .expect("read should not fail")
            .remove(0);
        store
            .link("s2", Check::MustBe(1), vec![e1.event_id])
            .await
            .expect("linking should not fail");

        store
            .delete("s", Check::Any, DeleteMode::Hard)
            .await
            .expect("hard deletion should not fail");

        let error = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect_err("the tombstone should be observable");
        assert!(matches!(error, ReadError::StreamDeleted));

        let all = store
            .read_all(SequenceSelect::All, Direction::Forward, 10)
            .await
            .expect("reading the global log should not fail");
        let types: Vec<_> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["e4"]);

        // The linked copy in s2 is gone as well; its own event remains.
        let events = store
            .read_stream("s2", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect("read should not fail");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "e4");
    }

    #[tokio::test]
    async fn a_hard_deleted_stream_can_be_recreated_from_version_zero() {
        let store = InMemory::default().with_hard_deletes();

        store
            .append("s", Check::MustBe(0), vec![event("e1")])
            .await
            .expect("append should not fail");
        store
            .delete("s", Check::Any, DeleteMode::Hard)
            .await
            .expect("hard deletion should not fail");

        let error = store
            .append("s", Check::StreamExists, vec![event("e2")])
            .await
            .expect_err("a non-recreating expectation observes the tombstone");
        assert!(matches!(error, AppendError::StreamDeleted));

        let version = store
            .append("s", Check::NoStream, vec![event("e2")])
            .await
            .expect("recreating the stream should not fail");
        assert_eq!(version, 1);

        let events = store
            .read_stream("s", VersionSelect::All, Direction::Forward, 10)
            .await
            .expect("read should not fail");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "e2");
    }

    #[tokio::test]
    async fn backward_reads_return_the_newest_events_first() {
        let store = InMemory::default();

        store
            .append(
                "s",
                Check::MustBe(0),
                vec![event("e1"), event("e2"), event("e3")],
            )
            .await
            .expect("append should not fail");

        let events = store
            .read_stream("s", VersionSelect::All, Direction::Backward, 2)
            .await
            .expect("read should not fail");

        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["e3", "e2"]);

        let all = store
            .read_all(SequenceSelect::From(2), Direction::Backward, 10)
            .await
            .expect("reading the global log should not fail");
        let types: Vec<_> = all.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["e2", "e1"]);
    }

    #[tokio::test]
    async fn the_all_stream_is_reserved() {
        let store = InMemory::default();

        assert!(matches!(
            store.append(stream::ALL, Check::Any, vec![event("e1")]).await,
            Err(AppendError::ReservedStream(_))
        ));
        assert!(matches!(
            store.delete(stream::ALL, Check::Any, DeleteMode::Soft).await,
            Err(DeleteError::ReservedStream(_))
        ));
    }

    #[tokio::test]
    async fn reading_the_all_stream_by_name_uses_the_global_log() {
        let store = InMemory::default();

        store
            .append("s", Check::MustBe(0), vec![event("e1")])
            .await
            .expect("append should not fail");

        let events: Vec<_> = store
            .stream(stream::ALL, VersionSelect::All)
            .try_collect()
            .await
            .expect("streaming the global log should not fail");

        assert_eq!(events.len(), 1);
    }
}
