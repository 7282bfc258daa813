//! Durable, named subscriptions: catch-up from the log, live delivery fed
//! by commit notifications, ack/nack tracking with parking, persistent
//! checkpoints and single-active-consumer failover.
//!
//! Each `(stream, name)` pair is served by one worker task per process,
//! owning the subscription state machine and an inbox of control
//! messages. Consumers talk to the worker through a [Subscription]
//! handle.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use everlog::stream::{is_all, ALL};
use everlog::subscription::{
    Consumer, Delivery, DeliveryToken, NackAction, Options, StartFrom, SubscribeError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::Store;
use self::worker::{Control, ConsumerSlot};

/// The Stream a subscription follows: a concrete Stream or the global
/// `$all` log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    All,
    Stream(String),
}

impl Target {
    fn parse(stream_id: &str) -> Self {
        if is_all(stream_id) {
            Target::All
        } else {
            Target::Stream(stream_id.to_owned())
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Target::All => ALL,
            Target::Stream(stream_id) => stream_id,
        }
    }
}

/// Per-process registry of subscription workers, one per `(stream, name)`
/// pair, enforcing the single-active-consumer discipline.
#[derive(Default)]
pub(crate) struct Registry {
    workers: Mutex<HashMap<(String, String), mpsc::Sender<Control>>>,
    next_consumer_id: AtomicU64,
}

impl Registry {
    fn next_consumer_id(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Removes the worker entry for the given subscription, regardless
    /// of its state. Only safe while the calling worker still owns the
    /// entry.
    pub(crate) fn remove(&self, target: &Target, name: &str) {
        self.workers
            .lock()
            .expect("acquire lock on the subscription worker registry")
            .remove(&(target.as_str().to_owned(), name.to_owned()));
    }

    /// Removes the worker entry only once its channel has closed, so an
    /// exiting worker never evicts a freshly spawned successor.
    pub(crate) fn deregister(&self, target: &Target, name: &str) {
        let key = (target.as_str().to_owned(), name.to_owned());
        let mut workers = self
            .workers
            .lock()
            .expect("acquire lock on the subscription worker registry");

        if workers.get(&key).is_some_and(mpsc::Sender::is_closed) {
            workers.remove(&key);
        }
    }
}

impl Store {
    /// Creates or resumes the durable subscription named `name` over the
    /// given Stream (or `$all`), attaching the returned handle as a
    /// consumer.
    ///
    /// The checkpoint row is created on first use, honoring
    /// [`Options::start_from`]; later subscriptions with the same
    /// `(stream, name)` pair resume from the stored checkpoint. At most
    /// one consumer receives deliveries at a time: additional consumers
    /// are queued for failover, unless [`Options::exclusive`] rejects
    /// them.
    pub async fn subscribe(
        &self,
        stream_id: &str,
        name: &str,
        options: Options,
    ) -> Result<Subscription, SubscribeError> {
        let target = Target::parse(stream_id);
        let (subscription_id, last_seen) = self
            .subscription_row(&target, name, options.start_from)
            .await?;

        // The registered worker may exit between the lookup and the
        // connect; retry against a freshly spawned one.
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let control = self.worker_sender(&target, name, options, subscription_id, last_seen);

            let consumer_id = self.registry.next_consumer_id();
            let (deliveries_tx, deliveries_rx) =
                mpsc::channel(options.max_in_flight.max(1) * 2);
            let (reply_tx, reply_rx) = oneshot::channel();

            let connect = Control::Connect {
                consumer: ConsumerSlot {
                    id: consumer_id,
                    deliveries: deliveries_tx,
                    last_heartbeat: Instant::now(),
                },
                exclusive: options.exclusive,
                reply: reply_tx,
            };

            if control.send(connect).await.is_err() {
                continue;
            }

            match reply_rx.await {
                Ok(Ok(())) => {
                    let heartbeat = spawn_heartbeat(
                        control.clone(),
                        consumer_id,
                        self.config.consumer_heartbeat_interval,
                    );

                    return Ok(Subscription {
                        stream_id: target.as_str().to_owned(),
                        name: name.to_owned(),
                        consumer_id,
                        control,
                        deliveries: deliveries_rx,
                        heartbeat,
                    });
                },
                Ok(Err(error)) => return Err(error),
                Err(_) => continue,
            }
        }

        Err(SubscribeError::Internal(anyhow!(
            "subscription worker is unavailable"
        )))
    }

    fn worker_sender(
        &self,
        target: &Target,
        name: &str,
        options: Options,
        subscription_id: i64,
        last_seen: u64,
    ) -> mpsc::Sender<Control> {
        let key = (target.as_str().to_owned(), name.to_owned());

        let mut workers = self
            .registry
            .workers
            .lock()
            .expect("acquire lock on the subscription worker registry");

        if let Some(sender) = workers.get(&key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let sender = worker::spawn(
            self.clone(),
            target.clone(),
            name.to_owned(),
            options,
            subscription_id,
            last_seen,
        );
        workers.insert(key, sender.clone());

        sender
    }

    /// Loads the subscription row, creating it with the initial
    /// checkpoint implied by `start_from` when it does not exist yet.
    async fn subscription_row(
        &self,
        target: &Target,
        name: &str,
        start_from: StartFrom,
    ) -> Result<(i64, u64), SubscribeError> {
        let initial = match start_from {
            StartFrom::Origin => 0,
            StartFrom::Position(position) => position,
            StartFrom::Current => self.head_position(target).await?,
        };

        sqlx::query(&format!(
            r"INSERT INTO {} (stream_id, name, last_seen)
              VALUES ($1, $2, $3)
              ON CONFLICT (stream_id, name) DO NOTHING",
            self.schema.table("subscriptions"),
        ))
        .bind(target.as_str())
        .bind(name)
        .bind(initial.min(i64::MAX as u64) as i64)
        .execute(&self.pool)
        .await
        .map_err(|error| anyhow!("failed to create subscription row: {error}"))?;

        let (id, last_seen): (i64, i64) = sqlx::query_as(&format!(
            "SELECT id, last_seen FROM {} WHERE stream_id = $1 AND name = $2",
            self.schema.table("subscriptions"),
        ))
        .bind(target.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| anyhow!("failed to load subscription row: {error}"))?;

        Ok((id, last_seen as u64))
    }

    /// Head position of the subscribed Stream: the latest global sequence
    /// for `$all`, the Stream version otherwise.
    async fn head_position(&self, target: &Target) -> Result<u64, SubscribeError> {
        let head: i64 = match target {
            Target::All => sqlx::query_scalar(&format!(
                "SELECT COALESCE(MAX(sequence_number), 0) FROM {}",
                self.schema.table("events"),
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(|error| anyhow!("failed to read the log head: {error}"))?,
            Target::Stream(stream_id) => sqlx::query_scalar(&format!(
                "SELECT COALESCE(MAX(stream_version), 0) FROM {} WHERE stream_id = $1",
                self.schema.table("streams"),
            ))
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| anyhow!("failed to read the stream head: {error}"))?,
        };

        Ok(head.max(0) as u64)
    }
}

fn spawn_heartbeat(
    control: mpsc::Sender<Control>,
    consumer_id: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if control
                .send(Control::Heartbeat { consumer_id })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

/// Consumer handle over a durable subscription.
///
/// Deliveries are received with [`Subscription::next`] and settled with
/// [`Subscription::ack`] or [`Subscription::nack`]. The handle heartbeats
/// automatically; dropping it disconnects the consumer, and the worker
/// fails over to the next queued consumer, if any.
pub struct Subscription {
    stream_id: String,
    name: String,
    consumer_id: u64,
    control: mpsc::Sender<Control>,
    deliveries: mpsc::Receiver<Delivery>,
    heartbeat: JoinHandle<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream_id", &self.stream_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The Stream this subscription follows.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The durable name of this subscription.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next delivery. Returns `None` once the subscription
    /// has been disconnected or unsubscribed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    async fn send(&self, control: Control) -> Result<(), SubscribeError> {
        self.control
            .send(control)
            .await
            .map_err(|_| SubscribeError::Disconnected)
    }

    /// Acknowledges a delivery. The checkpoint advances once every
    /// delivery up to this one has been settled.
    pub async fn ack(&self, token: DeliveryToken) -> Result<(), SubscribeError> {
        self.send(Control::Ack { token }).await
    }

    /// Refuses a delivery, choosing how the Event is handled next.
    pub async fn nack(
        &self,
        token: DeliveryToken,
        action: NackAction,
    ) -> Result<(), SubscribeError> {
        self.send(Control::Nack { token, action }).await
    }

    /// Administratively halts delivery until [`Subscription::resume`].
    pub async fn pause(&self) -> Result<(), SubscribeError> {
        self.send(Control::Pause).await
    }

    /// Resumes a paused subscription, reconciling from the log.
    pub async fn resume(&self) -> Result<(), SubscribeError> {
        self.send(Control::Resume).await
    }

    /// Redelivers every parked Event of this subscription. Returns how
    /// many replays were handed to the consumer; an ack removes the
    /// parked record.
    pub async fn replay_parked(&self) -> Result<usize, SubscribeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::ReplayParked { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SubscribeError::Disconnected)?
    }

    /// Deletes the durable subscription: the checkpoint row, its parked
    /// Events, and every attached consumer.
    pub async fn unsubscribe(self) -> Result<(), SubscribeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::Unsubscribe { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SubscribeError::Disconnected)?
    }

    /// Drives this subscription with a [Consumer] callback: deliveries
    /// are acked when the callback returns `Ok`, nacked with the returned
    /// action otherwise. Runs until the subscription disconnects.
    pub async fn run<C>(mut self, mut consumer: C) -> Result<(), SubscribeError>
    where
        C: Consumer,
    {
        while let Some(delivery) = self.next().await {
            match consumer.handle(&delivery).await {
                Ok(()) => self.ack(delivery.token).await?,
                Err(action) => self.nack(delivery.token, action).await?,
            }
        }

        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.heartbeat.abort();
        let _ = self.control.try_send(Control::Disconnect {
            consumer_id: self.consumer_id,
        });
    }
}
