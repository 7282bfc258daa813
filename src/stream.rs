//! Stream identity and lifecycle state.

/// Reserved id of the virtual Stream containing every live Event in the
/// Store, in global commit order.
///
/// `$all` is not backed by a Stream row: it is defined by the total order
/// of [`SequenceNumber`][crate::version::SequenceNumber]s. It can be read
/// and subscribed to, but not appended to, linked into, or deleted.
pub const ALL: &str = "$all";

/// Returns true if the given Stream id refers to the virtual `$all` Stream.
#[must_use]
pub fn is_all(stream_id: &str) -> bool {
    stream_id == ALL
}

/// Direction of a paged read over a Stream or the global log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the oldest selected position towards the head.
    Forward,

    /// From the newest selected position towards the origin.
    Backward,
}

/// Lifecycle state of a Stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletedState {
    /// The Stream is readable and appendable.
    #[default]
    Live,

    /// The Stream has been logically hidden: direct reads, appends and
    /// links fail, but its Events remain in the global log and in any
    /// Stream that linked them.
    SoftDeleted,

    /// The Stream's Events have been physically removed, and a tombstone
    /// is kept so readers holding cached positions observe the deletion
    /// instead of silently resuming. The Stream id can be reused from
    /// version 0.
    HardDeleted,
}

impl DeletedState {
    /// Returns true if the Stream has been deleted, either logically
    /// or physically.
    #[must_use]
    pub fn is_deleted(self) -> bool {
        !matches!(self, DeletedState::Live)
    }
}
