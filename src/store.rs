//! Contains the capability traits of an Event Store: appending, linking,
//! reading and deleting Event Streams.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::event::{Event, Recorded, SequenceSelect, VersionSelect};
use crate::stream::Direction;
use crate::version::{Check, ConflictError, Version};

/// Stream of [Recorded] Events produced by the paging readers.
pub type EventStream = BoxStream<'static, Result<Recorded, ReadError>>;

/// All possible error types returned by [`Appender::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The expected-version check failed. The caller should re-read the
    /// Stream and retry. This also covers failed [`Check::NoStream`] and
    /// [`Check::StreamExists`] expectations.
    #[error("failed to append to event stream: {0}")]
    Conflict(#[from] ConflictError),

    /// The target Stream has been deleted. Only a hard-deleted Stream can
    /// be recreated, by appending with a version expectation compatible
    /// with an empty Stream.
    #[error("event stream has been deleted")]
    StreamDeleted,

    /// The target Stream id is reserved and cannot be appended to.
    #[error("event stream id {0} is reserved")]
    ReservedStream(String),

    /// The backend has encountered an error, e.g. the database
    /// connection was lost.
    #[error("failed to append to event stream, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned by [`Linker::link`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The expected-version check on the target Stream failed.
    #[error("failed to link into event stream: {0}")]
    Conflict(#[from] ConflictError),

    /// The target Stream has been deleted.
    #[error("event stream has been deleted")]
    StreamDeleted,

    /// One of the Events to link does not exist in the Store.
    #[error("event {0} not found")]
    EventNotFound(Uuid),

    /// One of the Events is already present in the target Stream.
    /// An Event can be linked into a given Stream at most once.
    #[error("event {event_id} is already linked into stream {stream_id}")]
    DuplicateLink {
        /// The id of the Event that was already linked.
        event_id: Uuid,
        /// The target Stream.
        stream_id: String,
    },

    /// The target Stream id is reserved and cannot be linked into.
    #[error("event stream id {0} is reserved")]
    ReservedStream(String),

    /// The backend has encountered an error.
    #[error("failed to link into event stream, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned by the reading methods in [`Streamer`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The Stream has never existed.
    #[error("event stream not found")]
    StreamNotFound,

    /// The Stream has been deleted. Its Events are still readable through
    /// the global log if the deletion was soft.
    #[error("event stream has been deleted")]
    StreamDeleted,

    /// The backend has encountered an error.
    #[error("failed to read event stream, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Whether a deletion hides a Stream or physically removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Marks the Stream as deleted. Direct reads, appends and links fail
    /// afterwards, but the Stream's Events remain in the global log and
    /// in any Stream that linked them.
    Soft,

    /// Removes the Stream's Events, every link referencing them, and the
    /// Stream itself, leaving a tombstone behind. Must be enabled in the
    /// Store configuration.
    Hard,
}

/// All possible error types returned by [`Deleter::delete`].
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    /// The expected-version check failed.
    #[error("failed to delete event stream: {0}")]
    Conflict(#[from] ConflictError),

    /// The Stream has never existed.
    #[error("event stream not found")]
    StreamNotFound,

    /// The Stream has already been deleted.
    #[error("event stream has been deleted")]
    StreamDeleted,

    /// Hard deletions have not been enabled in the Store configuration.
    #[error("hard deletes are not enabled")]
    HardDeletesDisabled,

    /// The target Stream id is reserved and cannot be deleted.
    #[error("event stream id {0} is reserved")]
    ReservedStream(String),

    /// The backend has encountered an error.
    #[error("failed to delete event stream, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Interface used to append new Events to an Event Store.
#[async_trait]
pub trait Appender: Send + Sync {
    /// Appends the given Events to the specified Stream, after verifying
    /// the expected-version [`Check`].
    ///
    /// The Events of a batch are recorded atomically, adjacent both in
    /// Stream order and in global order. An empty batch still runs the
    /// version check, but records nothing.
    ///
    /// Returns the new [Version] of the Stream.
    async fn append(
        &self,
        stream_id: &str,
        check: Check,
        events: Vec<Event>,
    ) -> Result<Version, AppendError>;
}

/// Interface used to link existing Events into other Streams without
/// copying their payloads.
#[async_trait]
pub trait Linker: Send + Sync {
    /// Links the Events with the given ids into the specified Stream,
    /// after verifying the expected-version [`Check`].
    ///
    /// Linked Events keep their original Stream identity and their global
    /// [`SequenceNumber`][crate::version::SequenceNumber]; only the target
    /// Stream's version advances.
    ///
    /// Returns the new [Version] of the target Stream.
    async fn link(
        &self,
        stream_id: &str,
        check: Check,
        event_ids: Vec<Uuid>,
    ) -> Result<Version, LinkError>;
}

/// Interface used to read [Recorded] Events back from an Event Store.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Reads up to `limit` Events from the specified Stream, starting at
    /// the selected position and moving in the given [Direction].
    ///
    /// Events linked into the Stream are returned with their original
    /// `stream_id` and `version`; the paging cursor over the target Stream
    /// is positional and separate from those fields.
    async fn read_stream(
        &self,
        stream_id: &str,
        select: VersionSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError>;

    /// Reads up to `limit` Events from the global log, starting at the
    /// selected [`SequenceNumber`][crate::version::SequenceNumber] and
    /// moving in the given [Direction].
    async fn read_all(
        &self,
        select: SequenceSelect,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Recorded>, ReadError>;

    /// Opens a lazy, forward-paging [EventStream] over the specified
    /// Stream. The Stream is finite: it ends when the head at the time of
    /// each page read is reached. Restartable from any position.
    fn stream(&self, stream_id: &str, select: VersionSelect) -> EventStream;

    /// Opens a lazy, forward-paging [EventStream] over the global log.
    fn stream_all(&self, select: SequenceSelect) -> EventStream;
}

/// Interface used to delete Event Streams.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Deletes the specified Stream, after verifying the expected-version
    /// [`Check`].
    async fn delete(
        &self,
        stream_id: &str,
        check: Check,
        mode: DeleteMode,
    ) -> Result<(), DeleteError>;
}

/// An Event Store: an append-only, strongly-ordered log of Events
/// organized into named Streams.
pub trait Store: Appender + Linker + Streamer + Deleter + Send + Sync {}

impl<T> Store for T where T: Appender + Linker + Streamer + Deleter + Send + Sync {}
