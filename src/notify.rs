//! Commit notifications and the process-wide notification [Bus].
//!
//! Notifications are advisory: they tell subscribers that the log head has
//! moved, not what moved. Subscribers treat them as hints to wake up and
//! read the log, and fall back to periodic polling when notifications are
//! lost.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::version::{SequenceNumber, Version};

/// Default capacity of the [Bus] broadcast channel.
pub const DEFAULT_BUS_CAPACITY: usize = 128;

/// The kind of commit a [Notification] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// New Events were appended to a Stream.
    Appended,

    /// Existing Events were linked into a Stream.
    Linked,

    /// A Stream was soft-deleted.
    SoftDeleted,

    /// A Stream was hard-deleted. Subscribers drop in-flight deliveries
    /// originating from the Stream.
    HardDeleted,
}

/// A small message fanned out after each successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The Stream the commit applied to.
    pub stream_id: String,

    /// First Stream position written by the commit.
    pub from_version: Version,

    /// Last Stream position written by the commit.
    pub to_version: Version,

    /// First global sequence number covered by the commit.
    pub from_sequence: SequenceNumber,

    /// Last global sequence number covered by the commit.
    pub to_sequence: SequenceNumber,

    /// The kind of commit.
    pub kind: NotificationKind,
}

/// Single-writer, many-reader broadcast endpoint for [Notification]s.
///
/// The Bus owns no durable data: it can be dropped and reconstructed at
/// any time, and receivers that fall behind observe a lag error rather
/// than blocking the writer.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: broadcast::Sender<Notification>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl Bus {
    /// Creates a new Bus with the given broadcast capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes a [Notification] to all current subscribers.
    ///
    /// Delivery is best-effort: publishing with no active subscribers is
    /// not an error, and slow subscribers may miss messages.
    pub fn publish(&self, notification: Notification) {
        if let Err(error) = self.tx.send(notification) {
            tracing::trace!(?error, "notification dropped, no active subscribers");
        }
    }

    /// Registers a new subscriber, receiving every [Notification]
    /// published from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn appended(stream_id: &str) -> Notification {
        Notification {
            stream_id: stream_id.to_owned(),
            from_version: 1,
            to_version: 2,
            from_sequence: 10,
            to_sequence: 11,
            kind: NotificationKind::Appended,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let bus = Bus::default();
        let mut rx = bus.subscribe();

        bus.publish(appended("orders:1"));

        let received = rx.recv().await.expect("notification should be received");
        assert_eq!(received, appended("orders:1"));
    }

    #[test]
    fn publishing_without_subscribers_does_not_fail() {
        let bus = Bus::default();
        bus.publish(appended("orders:1"));
    }

    #[test]
    fn wire_format_round_trips() {
        let notification = appended("orders:1");

        let payload =
            serde_json::to_string(&notification).expect("notification should serialize to json");
        let decoded: Notification =
            serde_json::from_str(&payload).expect("notification should deserialize from json");

        assert_eq!(notification, decoded);
    }

    #[test]
    fn kinds_use_snake_case_on_the_wire() {
        let payload = serde_json::to_string(&NotificationKind::HardDeleted)
            .expect("kind should serialize to json");

        assert_eq!(payload, r#""hard_deleted""#);
    }
}
