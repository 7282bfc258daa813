//! Vocabulary shared by durable subscription implementations: creation
//! options, the subscription state machine, delivery envelopes, ack/nack
//! actions, and the bounded in-flight window tracker.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::event::Recorded;

/// Opaque token identifying a single delivery of an Event to a consumer.
///
/// Redeliveries of the same Event carry a fresh token.
pub type DeliveryToken = u64;

/// Where a subscription starts reading when its checkpoint row is created.
///
/// Subsequent subscriptions with the same `(stream, name)` pair resume
/// from the stored checkpoint and ignore this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// From the beginning of the subscribed Stream.
    Origin,

    /// From the head of the subscribed Stream at creation time; only
    /// Events recorded afterwards are delivered.
    Current,

    /// From an explicit position: a Stream version for concrete Streams,
    /// a global sequence number for `$all`. Events *after* this position
    /// are delivered.
    Position(u64),
}

/// The state of a durable subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The subscription has been registered but no consumer has been
    /// evaluated yet.
    Initial,

    /// Paging Events from the log until the head is reached. The
    /// notification bus is not consulted in this state.
    CatchingUp,

    /// Live: deliveries are triggered by commit notifications, with a
    /// periodic poll of the log head as a fallback.
    Subscribed,

    /// No consumer is attached. The checkpoint row is retained and a
    /// reconnecting consumer resumes from it.
    Disconnected,

    /// Administratively halted.
    Paused,
}

impl State {
    /// Stable textual form, used when persisting the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::CatchingUp => "catching_up",
            State::Subscribed => "subscribed",
            State::Disconnected => "disconnected",
            State::Paused => "paused",
        }
    }
}

/// What to do with a delivery the consumer did not acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver immediately. After `max_retries` failed attempts the
    /// Event is parked automatically.
    Retry,

    /// Advance past the Event without invoking the consumer again.
    Skip,

    /// Remove the Event from the in-flight window and record it for
    /// manual replay.
    Park,
}

/// Options used when creating or attaching to a durable subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Where to start reading on first use. Default: [`StartFrom::Origin`].
    pub start_from: StartFrom,

    /// Maximum number of Events delivered without acknowledgement.
    pub max_in_flight: usize,

    /// Number of [`NackAction::Retry`] redeliveries before an Event is
    /// parked automatically.
    pub max_retries: u32,

    /// Time a delivery may stay unacknowledged before it is redelivered.
    pub ack_timeout: Duration,

    /// When true, attaching a second consumer fails instead of queueing
    /// it for failover.
    pub exclusive: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start_from: StartFrom::Origin,
            max_in_flight: 100,
            max_retries: 3,
            ack_timeout: Duration::from_secs(30),
            exclusive: false,
        }
    }
}

/// A single delivery of a [Recorded] Event to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Token to pass back through `ack` or `nack`.
    pub token: DeliveryToken,

    /// Position of the Event in the subscribed Stream: its version for a
    /// concrete Stream, its global sequence number for `$all`.
    pub position: u64,

    /// 1-based delivery attempt counter.
    pub attempt: u32,

    /// The delivered Event.
    pub event: Recorded,
}

/// A consumer callback handling deliveries in order.
///
/// Returning `Err` nacks the delivery with the given action; failures to
/// decode the payload are reported the same way.
#[async_trait]
pub trait Consumer: Send {
    /// Handles a single delivery.
    async fn handle(&mut self, delivery: &Delivery) -> Result<(), NackAction>;
}

/// All possible error types returned when creating or driving a
/// subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// An exclusive subscription already has an attached consumer.
    #[error("a consumer is already subscribed to {stream_id}/{name}")]
    AlreadySubscribed {
        /// The subscribed Stream.
        stream_id: String,
        /// The subscription name.
        name: String,
    },

    /// The subscription has been disconnected and can no longer be driven
    /// through this handle.
    #[error("subscription has been disconnected")]
    Disconnected,

    /// The backend has encountered an error.
    #[error("subscription failed, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Outcome of completing a delivery in the [InFlight] window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The contiguous acknowledged prefix grew: `last_seen` advanced to
    /// the given position, covering `count` deliveries.
    Advanced {
        /// The new `last_seen` position.
        to: u64,
        /// How many deliveries were released from the window.
        count: usize,
    },

    /// The delivery was marked done, but an earlier delivery is still
    /// pending: `last_seen` is unchanged.
    Buffered,

    /// A replayed parked Event completed. Replays sit behind `last_seen`
    /// and never move the checkpoint.
    Replay {
        /// The parked position that completed.
        position: u64,
    },
}

/// A delivery pulled out of the window for immediate redelivery.
#[derive(Debug, Clone)]
pub struct Redelivery {
    /// Position of the Event in the subscribed Stream.
    pub position: u64,

    /// The attempt counter the redelivery should carry.
    pub attempt: u32,

    /// Whether the delivery was a parked-Event replay.
    pub replayed: bool,

    /// The Event to deliver again.
    pub event: Recorded,
}

#[derive(Debug)]
struct Entry {
    token: DeliveryToken,
    attempt: u32,
    delivered_at: Instant,
    done: bool,
    event: Recorded,
}

/// Tracker for the delivered-but-unacknowledged window of a subscription.
///
/// The window is bounded by `max_in_flight`. Acknowledgements may arrive
/// out of order: they are buffered, and `last_seen` only advances past the
/// contiguous acknowledged prefix of delivered positions. Replayed parked
/// Events are tracked separately, since their positions lie behind
/// `last_seen`.
#[derive(Debug)]
pub struct InFlight {
    max: usize,
    last_seen: u64,
    next_token: DeliveryToken,
    window: BTreeMap<u64, Entry>,
    tokens: HashMap<DeliveryToken, u64>,
    replays: HashMap<DeliveryToken, (u64, Entry)>,
}

impl InFlight {
    /// Creates an empty window on top of the given checkpoint.
    #[must_use]
    pub fn new(max_in_flight: usize, last_seen: u64) -> Self {
        Self {
            max: max_in_flight.max(1),
            last_seen,
            next_token: 1,
            window: BTreeMap::new(),
            tokens: HashMap::new(),
            replays: HashMap::new(),
        }
    }

    /// The highest position every delivery up to which has been completed.
    #[must_use]
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Number of deliveries currently in flight, replays included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len() + self.replays.len()
    }

    /// Returns true when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.replays.is_empty()
    }

    /// Returns true when another Event can be delivered without exceeding
    /// `max_in_flight`.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.len() < self.max
    }

    fn assign_token(&mut self) -> DeliveryToken {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Tracks a delivery at the given position and returns its token.
    pub fn track(&mut self, position: u64, attempt: u32, event: Recorded) -> DeliveryToken {
        let token = self.assign_token();

        self.window.insert(
            position,
            Entry {
                token,
                attempt,
                delivered_at: Instant::now(),
                done: false,
                event,
            },
        );
        self.tokens.insert(token, position);

        token
    }

    /// Tracks the replay of a parked Event. Replays occupy window capacity
    /// but never move `last_seen`.
    pub fn track_replay(&mut self, position: u64, attempt: u32, event: Recorded) -> DeliveryToken {
        let token = self.assign_token();

        self.replays.insert(
            token,
            (
                position,
                Entry {
                    token,
                    attempt,
                    delivered_at: Instant::now(),
                    done: false,
                    event,
                },
            ),
        );

        token
    }

    /// The position a token was delivered for, if it is still in flight.
    #[must_use]
    pub fn position_of(&self, token: DeliveryToken) -> Option<u64> {
        self.tokens
            .get(&token)
            .copied()
            .or_else(|| self.replays.get(&token).map(|(position, _)| *position))
    }

    fn entry_of(&self, token: DeliveryToken) -> Option<&Entry> {
        self.tokens
            .get(&token)
            .and_then(|position| self.window.get(position))
            .or_else(|| self.replays.get(&token).map(|(_, entry)| entry))
    }

    /// The attempt counter a token was delivered with, if it is still
    /// in flight.
    #[must_use]
    pub fn attempt_of(&self, token: DeliveryToken) -> Option<u32> {
        self.entry_of(token).map(|entry| entry.attempt)
    }

    /// The Event a token was delivered for, if it is still in flight.
    #[must_use]
    pub fn event_of(&self, token: DeliveryToken) -> Option<&Recorded> {
        self.entry_of(token).map(|entry| &entry.event)
    }

    /// Completes a delivery (ack, skip, or park), possibly advancing
    /// `last_seen`. Returns `None` if the token is not in flight.
    pub fn complete(&mut self, token: DeliveryToken) -> Option<Completion> {
        if let Some((position, _)) = self.replays.remove(&token) {
            return Some(Completion::Replay { position });
        }

        let position = self.tokens.remove(&token)?;
        self.window.get_mut(&position)?.done = true;

        let mut advanced = None;
        let mut count = 0;

        while let Some(entry) = self.window.first_entry() {
            if !entry.get().done {
                break;
            }

            let (position, _) = entry.remove_entry();
            self.last_seen = self.last_seen.max(position);
            advanced = Some(position);
            count += 1;
        }

        match advanced {
            Some(to) => Some(Completion::Advanced { to, count }),
            None => Some(Completion::Buffered),
        }
    }

    /// Pulls a delivery out of the window for immediate redelivery,
    /// incrementing its attempt counter. The caller re-tracks the returned
    /// [Redelivery] (or parks it, once the attempt counter exceeds the
    /// retry budget). Returns `None` if the token is not in flight.
    pub fn take_for_retry(&mut self, token: DeliveryToken) -> Option<Redelivery> {
        if let Some((position, entry)) = self.replays.remove(&token) {
            return Some(Redelivery {
                position,
                attempt: entry.attempt + 1,
                replayed: true,
                event: entry.event,
            });
        }

        let position = self.tokens.remove(&token)?;
        let entry = self.window.remove(&position)?;

        Some(Redelivery {
            position,
            attempt: entry.attempt + 1,
            replayed: false,
            event: entry.event,
        })
    }

    /// Tokens of pending deliveries older than `timeout` at `now`,
    /// candidates for automatic redelivery.
    #[must_use]
    pub fn overdue(&self, timeout: Duration, now: Instant) -> Vec<DeliveryToken> {
        let expired = |entry: &Entry| {
            !entry.done && now.saturating_duration_since(entry.delivered_at) >= timeout
        };

        self.window
            .values()
            .filter(|entry| expired(entry))
            .map(|entry| entry.token)
            .chain(
                self.replays
                    .values()
                    .filter(|(_, entry)| expired(entry))
                    .map(|(_, entry)| entry.token),
            )
            .collect()
    }

    /// Drops every in-flight delivery originating from the given Stream,
    /// completing them as if acknowledged. Used to reconcile the window
    /// after a Stream is hard-deleted.
    ///
    /// Returns the new `last_seen` if the prefix advanced, and the parked
    /// positions whose replays were dropped.
    pub fn drop_stream(&mut self, stream_id: &str) -> (Option<u64>, Vec<u64>) {
        let dropped_replays: Vec<u64> = {
            let tokens: Vec<DeliveryToken> = self
                .replays
                .iter()
                .filter(|(_, (_, entry))| entry.event.stream_id == stream_id)
                .map(|(token, _)| *token)
                .collect();

            tokens
                .into_iter()
                .filter_map(|token| self.replays.remove(&token).map(|(position, _)| position))
                .collect()
        };

        let tokens: Vec<DeliveryToken> = self
            .window
            .values()
            .filter(|entry| entry.event.stream_id == stream_id)
            .map(|entry| entry.token)
            .collect();

        let mut advanced = None;
        for token in tokens {
            if let Some(Completion::Advanced { to, .. }) = self.complete(token) {
                advanced = Some(to);
            }
        }

        (advanced, dropped_replays)
    }
}
