//! Contains the Event data model: the [`Event`] type proposed by callers
//! for appending, and the [`Recorded`] type read back from a Store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec::Codec;
use crate::version::{SequenceNumber, Version};

/// A new Event proposed for appending to a Stream.
///
/// The payload (`data`) and `metadata` are opaque to the Store: encoding
/// and decoding are delegated to a [`Codec`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unique id of the Event. Assigned by the Store at append time
    /// when not supplied by the caller.
    pub id: Option<Uuid>,

    /// Free-form name describing the shape of the payload.
    pub event_type: String,

    /// The encoded Event payload.
    pub data: Vec<u8>,

    /// Optional encoded metadata, to provide additional context.
    pub metadata: Vec<u8>,

    /// The id of the Event (usually, a Command) that caused this Event.
    pub causation_id: Option<Uuid>,

    /// The id correlating this Event with other Events across Streams.
    pub correlation_id: Option<Uuid>,
}

impl Event {
    /// Creates a new Event with the given type name and encoded payload.
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            data,
            metadata: Vec::new(),
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Creates a new Event by encoding `value` through the given [`Codec`].
    pub fn encode<T, C>(event_type: impl Into<String>, value: &T, codec: &C) -> Self
    where
        C: Codec<T>,
    {
        Self::new(event_type, codec.encode(value))
    }

    /// Assigns an explicit Event id, instead of letting the Store
    /// assign one at append time.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Attaches encoded metadata to the Event.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Records the id of the Message that caused this Event.
    #[must_use]
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Records the id correlating this Event with others.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// An [Event] that has been recorded in a Store.
///
/// `stream_id` and `version` always refer to the Stream the Event was
/// originally appended to: reading the Event through the global log or
/// through a Stream it was linked into does not change them. The position
/// used to page through a Stream is carried separately by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Unique id of the Event.
    pub event_id: Uuid,

    /// The id of the Stream the Event was originally appended to.
    pub stream_id: String,

    /// 1-based position of the Event within its original Stream.
    pub version: Version,

    /// Free-form name describing the shape of the payload.
    pub event_type: String,

    /// The encoded Event payload.
    pub data: Vec<u8>,

    /// Optional encoded metadata.
    pub metadata: Vec<u8>,

    /// The id of the Message that caused this Event, if recorded.
    pub causation_id: Option<Uuid>,

    /// The id correlating this Event with other Events, if recorded.
    pub correlation_id: Option<Uuid>,

    /// Position of the Event in the global log, assigned at commit time.
    pub sequence_number: SequenceNumber,

    /// Wall-clock time at which the Event was committed.
    pub recorded_at: DateTime<Utc>,
}

impl Recorded {
    /// The position of the Event within its original Stream.
    /// Alias of [`Recorded::version`].
    #[must_use]
    pub fn event_number(&self) -> Version {
        self.version
    }

    /// Decodes the Event payload through the given [`Codec`].
    pub fn decode<T, C>(&self, codec: &C) -> Result<T, C::Error>
    where
        C: Codec<T>,
    {
        codec.decode(&self.data)
    }
}

/// Specifies the slice of an Event Stream to select when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    /// Selects all Events in the Stream.
    All,

    /// Selects all Events starting from (and including) the given
    /// Stream position.
    From(Version),
}

/// Specifies the slice of the global log to select when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSelect {
    /// Selects all Events in the global log.
    All,

    /// Selects all Events starting from (and including) the given
    /// [`SequenceNumber`].
    From(SequenceNumber),
}
