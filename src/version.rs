//! Contains the types necessary for Optimistic Locking through versioning.

use serde::{Deserialize, Serialize};

/// The version of an Event Stream, i.e. the number of Events recorded
/// (or linked) in it. An empty Stream has version `0`, and each appended
/// or linked Event increments it by `1`.
pub type Version = u64;

/// The position of an Event in the global log, assigned once at commit time
/// and never re-assigned when the Event is linked into other Streams.
pub type SequenceNumber = u64;

/// The Stream state an [`append`], [`link`] or [`delete`] caller expects
/// to find, used for optimistic concurrency control.
///
/// [`append`]: crate::store::Appender::append
/// [`link`]: crate::store::Linker::link
/// [`delete`]: crate::store::Deleter::delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    /// Skip the optimistic concurrency check entirely.
    Any,

    /// The Stream must not exist yet.
    NoStream,

    /// The Stream must exist, with at least one Event recorded in it.
    StreamExists,

    /// The Stream version must be exactly the one specified.
    ///
    /// `MustBe(0)` against a Stream that does not exist yet passes,
    /// and creates the Stream.
    MustBe(Version),
}

impl Check {
    /// Runs the check against the observed state of a Stream, where `current`
    /// is `None` if the Stream does not exist.
    pub fn verify(self, current: Option<Version>) -> Result<(), ConflictError> {
        let passed = match self {
            Check::Any => true,
            Check::NoStream => current.is_none(),
            Check::StreamExists => matches!(current, Some(v) if v >= 1),
            Check::MustBe(expected) => current.unwrap_or(0) == expected,
        };

        if passed {
            return Ok(());
        }

        Err(ConflictError {
            expected: self,
            actual: current.unwrap_or(0),
        })
    }
}

/// This error is returned by a function when a version conflict error has
/// been detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("version check failed, expected: {expected:?}, actual stream version: {actual}")]
pub struct ConflictError {
    /// The [Check] that was requested by the caller of the function that failed.
    pub expected: Check,

    /// The actual [Version] of the Stream, which caused the mismatch.
    /// `0` if the Stream does not exist.
    pub actual: Version,
}
