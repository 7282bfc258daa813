//! The per-subscription worker task: a state machine driving catch-up,
//! the live switchover, the in-flight window, checkpointing and
//! consumer failover, fed by an inbox of control messages.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::anyhow;
use everlog::event::{Recorded, SequenceSelect, VersionSelect};
use everlog::notify::{Notification, NotificationKind};
use everlog::store::ReadError;
use everlog::stream::Direction;
use everlog::subscription::{
    Completion, Delivery, DeliveryToken, InFlight, NackAction, Options, State, SubscribeError,
};
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::Target;
use crate::store::{self, Positioned, Store, EVENT_COLUMNS};

/// A consumer attached to the worker: the active one receives
/// deliveries, the others wait in the failover queue.
pub(crate) struct ConsumerSlot {
    pub id: u64,
    pub deliveries: mpsc::Sender<Delivery>,
    pub last_heartbeat: Instant,
}

/// Messages accepted by the worker inbox.
pub(crate) enum Control {
    Connect {
        consumer: ConsumerSlot,
        exclusive: bool,
        reply: oneshot::Sender<Result<(), SubscribeError>>,
    },
    Ack {
        token: DeliveryToken,
    },
    Nack {
        token: DeliveryToken,
        action: NackAction,
    },
    Heartbeat {
        consumer_id: u64,
    },
    Pause,
    Resume,
    Disconnect {
        consumer_id: u64,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<(), SubscribeError>>,
    },
    ReplayParked {
        reply: oneshot::Sender<Result<usize, SubscribeError>>,
    },
}

const CONTROL_BUFFER: usize = 64;

pub(crate) fn spawn(
    store: Store,
    target: Target,
    name: String,
    options: Options,
    subscription_id: i64,
    last_seen: u64,
) -> mpsc::Sender<Control> {
    let (tx, rx) = mpsc::channel(CONTROL_BUFFER);
    let notifications = store.bus.subscribe();

    let worker = Worker {
        in_flight: InFlight::new(options.max_in_flight, last_seen),
        cursor: last_seen,
        store,
        target,
        name,
        options,
        subscription_id,
        control: rx,
        notifications,
        state: State::Initial,
        active: None,
        pending: VecDeque::new(),
        advances_since_checkpoint: 0,
        unsubscribed: false,
    };

    tokio::spawn(worker.run());

    tx
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliverOutcome {
    Delivered,
    /// The consumer went away or the state changed mid-delivery; the
    /// caller abandons its page and lets the main loop re-dispatch.
    Stop,
    Exit,
}

struct Worker {
    store: Store,
    target: Target,
    name: String,
    options: Options,
    subscription_id: i64,
    control: mpsc::Receiver<Control>,
    notifications: broadcast::Receiver<Notification>,
    state: State,
    in_flight: InFlight,
    /// Position of the latest delivered (not necessarily acknowledged)
    /// Event; catch-up and live reads resume after it.
    cursor: u64,
    active: Option<ConsumerSlot>,
    pending: VecDeque<ConsumerSlot>,
    advances_since_checkpoint: usize,
    unsubscribed: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.store.config.poll_interval);
        let mut sweep = tokio::time::interval(self.store.config.consumer_heartbeat_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            match self.state {
                State::CatchingUp => {
                    if self.catch_up_step().await == Flow::Exit {
                        break;
                    }
                },
                State::Subscribed => {
                    tokio::select! {
                        biased;
                        message = self.control.recv() => {
                            let Some(message) = message else { break };
                            if self.handle(message).await == Flow::Exit {
                                break;
                            }
                        }
                        notification = self.notifications.recv() => {
                            if self.on_notification(notification).await == Flow::Exit {
                                break;
                            }
                        }
                        _ = poll.tick() => {
                            if self.pump().await == Flow::Exit {
                                break;
                            }
                        }
                        _ = sweep.tick() => {
                            if self.sweep().await == Flow::Exit {
                                break;
                            }
                        }
                    }
                },
                State::Initial | State::Disconnected | State::Paused => {
                    tokio::select! {
                        message = self.control.recv() => {
                            let Some(message) = message else { break };
                            if self.handle(message).await == Flow::Exit {
                                break;
                            }
                        }
                        _ = sweep.tick() => {
                            if self.sweep().await == Flow::Exit {
                                break;
                            }
                        }
                    }
                },
            }
        }

        self.shutdown().await;
    }

    /// Pages one batch from the log. Reaching the head drains the inbox,
    /// then flips to live mode; the drain is what keeps the switchover
    /// from reordering control effects around the mode flip.
    async fn catch_up_step(&mut self) -> Flow {
        if self.active.is_none() {
            self.set_state(State::Disconnected).await;
            return Flow::Continue;
        }

        let page = match self
            .read_after(self.cursor, self.store.config.read_batch_size)
            .await
        {
            Ok(page) => page,
            // Subscribing to a stream that does not exist yet is allowed:
            // wait for its first events.
            Err(ReadError::StreamNotFound) => Vec::new(),
            Err(error) => {
                tracing::warn!(
                    subscription.name = %self.name,
                    %error,
                    "subscription failed to read the log"
                );
                return self.fail().await;
            },
        };

        if page.is_empty() {
            loop {
                match self.control.try_recv() {
                    Ok(message) => {
                        if self.handle(message).await == Flow::Exit {
                            return Flow::Exit;
                        }
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Flow::Exit,
                }
            }

            if self.state == State::CatchingUp {
                self.set_state(State::Subscribed).await;
            }

            return Flow::Continue;
        }

        for row in page {
            match self.deliver(row.position, 1, row.event, false).await {
                DeliverOutcome::Delivered => {},
                DeliverOutcome::Stop => return Flow::Continue,
                DeliverOutcome::Exit => return Flow::Exit,
            }
        }

        Flow::Continue
    }

    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Positioned>, ReadError> {
        match &self.target {
            Target::All => {
                self.store
                    .read_all_rows(SequenceSelect::From(after + 1), Direction::Forward, limit)
                    .await
            },
            Target::Stream(stream_id) => {
                self.store
                    .read_stream_rows(
                        stream_id,
                        VersionSelect::From(after + 1),
                        Direction::Forward,
                        limit,
                    )
                    .await
            },
        }
    }

    /// Delivers one Event, waiting for window capacity by processing
    /// control messages, so acknowledgements keep flowing while the
    /// window is full. The housekeeping sweep keeps running here too:
    /// a stalled consumer must still trigger redelivery and parking.
    async fn deliver(
        &mut self,
        position: u64,
        attempt: u32,
        event: Recorded,
        replayed: bool,
    ) -> DeliverOutcome {
        // A failover mid-wait resets the cursor: this event will be read
        // again for the new consumer, so it must not be delivered here.
        let consumer = self.active.as_ref().map(|c| c.id);

        while !self.in_flight.has_capacity() {
            // Boxed: handling a message (or the sweep) can recurse into
            // delivery, e.g. through a nacked retry.
            let flow = tokio::select! {
                message = self.control.recv() => {
                    let Some(message) = message else {
                        return DeliverOutcome::Exit;
                    };
                    Box::pin(self.handle(message)).await
                }
                _ = tokio::time::sleep(self.store.config.consumer_heartbeat_interval) => {
                    Box::pin(self.sweep()).await
                }
            };

            if flow == Flow::Exit {
                return DeliverOutcome::Exit;
            }

            if self.active.as_ref().map(|c| c.id) != consumer
                || !matches!(self.state, State::CatchingUp | State::Subscribed)
            {
                return DeliverOutcome::Stop;
            }
        }

        if !matches!(self.state, State::CatchingUp | State::Subscribed) {
            return DeliverOutcome::Stop;
        }

        let Some(active) = self.active.as_ref() else {
            return DeliverOutcome::Stop;
        };

        let token = if replayed {
            self.in_flight.track_replay(position, attempt, event.clone())
        } else {
            self.in_flight.track(position, attempt, event.clone())
        };

        let delivery = Delivery {
            token,
            position,
            attempt,
            event,
        };

        if active.deliveries.try_send(delivery).is_err() {
            tracing::warn!(
                subscription.name = %self.name,
                consumer.id = active.id,
                "consumer is not draining deliveries, failing over"
            );
            self.in_flight.take_for_retry(token);
            self.consumer_lost().await;
            return DeliverOutcome::Stop;
        }

        if !replayed && position > self.cursor {
            self.cursor = position;
        }

        DeliverOutcome::Delivered
    }

    /// Reads and delivers everything committed after the cursor. Used in
    /// live mode, where notifications are only hints and the log is
    /// authoritative.
    async fn pump(&mut self) -> Flow {
        if self.active.is_none() {
            return Flow::Continue;
        }

        loop {
            let batch = self.store.config.read_batch_size;
            let page = match self.read_after(self.cursor, batch).await {
                Ok(page) => page,
                Err(ReadError::StreamNotFound) => return Flow::Continue,
                Err(error) => {
                    tracing::warn!(
                        subscription.name = %self.name,
                        %error,
                        "subscription failed to read the log"
                    );
                    return self.fail().await;
                },
            };

            let count = page.len();
            for row in page {
                match self.deliver(row.position, 1, row.event, false).await {
                    DeliverOutcome::Delivered => {},
                    DeliverOutcome::Stop => return Flow::Continue,
                    DeliverOutcome::Exit => return Flow::Exit,
                }
            }

            if count < batch {
                return Flow::Continue;
            }
        }
    }

    async fn on_notification(
        &mut self,
        notification: Result<Notification, broadcast::error::RecvError>,
    ) -> Flow {
        let notification = match notification {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(
                    subscription.name = %self.name,
                    missed,
                    "notification bus lagged, reconciling from the log"
                );
                self.set_state(State::CatchingUp).await;
                return Flow::Continue;
            },
            // The periodic poll keeps the subscription moving.
            Err(broadcast::error::RecvError::Closed) => return Flow::Continue,
        };

        match (&self.target, notification.kind) {
            (target, NotificationKind::HardDeleted) => {
                let subscribed_to_deleted =
                    matches!(target, Target::Stream(s) if *s == notification.stream_id);

                let (advanced, _) = self.in_flight.drop_stream(&notification.stream_id);
                if advanced.is_some() {
                    self.advances_since_checkpoint += 1;
                    self.flush_checkpoint().await;
                }
                self.delete_parked_for_stream(&notification.stream_id).await;

                if subscribed_to_deleted {
                    tracing::warn!(
                        subscription.name = %self.name,
                        stream.id = %notification.stream_id,
                        "subscribed stream was hard-deleted"
                    );
                    return self.fail().await;
                }

                Flow::Continue
            },
            (Target::Stream(s), NotificationKind::SoftDeleted)
                if *s == notification.stream_id =>
            {
                tracing::warn!(
                    subscription.name = %self.name,
                    stream.id = %notification.stream_id,
                    "subscribed stream was soft-deleted"
                );
                self.fail().await
            },
            (_, NotificationKind::SoftDeleted) => Flow::Continue,
            (Target::All, NotificationKind::Appended) => {
                if notification.to_sequence <= self.cursor {
                    Flow::Continue
                } else if notification.from_sequence > self.cursor + 1 {
                    // A commit was missed (or removed): reconcile.
                    self.set_state(State::CatchingUp).await;
                    Flow::Continue
                } else {
                    self.pump().await
                }
            },
            // Links never extend the global log.
            (Target::All, NotificationKind::Linked) => Flow::Continue,
            (Target::Stream(s), NotificationKind::Appended | NotificationKind::Linked)
                if *s == notification.stream_id =>
            {
                if notification.to_version <= self.cursor {
                    Flow::Continue
                } else if notification.from_version > self.cursor + 1 {
                    self.set_state(State::CatchingUp).await;
                    Flow::Continue
                } else {
                    self.pump().await
                }
            },
            _ => Flow::Continue,
        }
    }

    /// Periodic housekeeping: consumer liveness and acknowledgement
    /// timeouts.
    async fn sweep(&mut self) -> Flow {
        if let Some(active) = &self.active {
            let stalled =
                active.last_heartbeat.elapsed() > self.store.config.consumer_timeout;

            if stalled || active.deliveries.is_closed() {
                tracing::debug!(
                    subscription.name = %self.name,
                    consumer.id = active.id,
                    "consumer is gone, failing over"
                );
                self.consumer_lost().await;
            }
        }

        if self.active.is_none() && self.pending.is_empty() && self.state == State::Disconnected
        {
            return Flow::Exit;
        }

        for token in self
            .in_flight
            .overdue(self.options.ack_timeout, Instant::now())
        {
            if self.redeliver(token, "acknowledgement timed out").await == Flow::Exit {
                return Flow::Exit;
            }
        }

        Flow::Continue
    }

    async fn handle(&mut self, message: Control) -> Flow {
        match message {
            Control::Connect {
                consumer,
                exclusive,
                reply,
            } => {
                if self.active.is_some() {
                    if exclusive {
                        let _ = reply.send(Err(SubscribeError::AlreadySubscribed {
                            stream_id: self.target.as_str().to_owned(),
                            name: self.name.clone(),
                        }));
                    } else {
                        self.pending.push_back(consumer);
                        let _ = reply.send(Ok(()));
                    }
                } else {
                    self.attach(consumer).await;
                    let _ = reply.send(Ok(()));
                }
                Flow::Continue
            },
            Control::Ack { token } => {
                self.touch();
                self.settle(token).await;
                Flow::Continue
            },
            Control::Nack { token, action } => {
                self.touch();
                match action {
                    NackAction::Retry => self.redeliver(token, "nacked by the consumer").await,
                    NackAction::Skip => {
                        self.settle(token).await;
                        Flow::Continue
                    },
                    NackAction::Park => {
                        self.park(token, "parked by the consumer").await;
                        Flow::Continue
                    },
                }
            },
            Control::Heartbeat { consumer_id } => {
                if let Some(active) = self.active.as_mut() {
                    if active.id == consumer_id {
                        active.last_heartbeat = Instant::now();
                        return Flow::Continue;
                    }
                }
                for consumer in &mut self.pending {
                    if consumer.id == consumer_id {
                        consumer.last_heartbeat = Instant::now();
                    }
                }
                Flow::Continue
            },
            Control::Pause => {
                self.set_state(State::Paused).await;
                Flow::Continue
            },
            Control::Resume => {
                if self.state == State::Paused {
                    if self.active.is_some() {
                        self.set_state(State::CatchingUp).await;
                    } else {
                        self.set_state(State::Disconnected).await;
                    }
                }
                Flow::Continue
            },
            Control::Disconnect { consumer_id } => {
                if self.active.as_ref().map(|c| c.id) == Some(consumer_id) {
                    self.consumer_lost().await;
                    if self.active.is_none() && self.pending.is_empty() {
                        return Flow::Exit;
                    }
                } else {
                    self.pending.retain(|c| c.id != consumer_id);
                }
                Flow::Continue
            },
            Control::Unsubscribe { reply } => {
                let result = self.delete_subscription().await;
                self.unsubscribed = result.is_ok();
                if self.unsubscribed {
                    // Free the registry slot before replying, so a
                    // re-subscribe cannot race against this worker's
                    // teardown.
                    self.store.registry.remove(&self.target, &self.name);
                }
                let _ = reply.send(result);
                Flow::Exit
            },
            Control::ReplayParked { reply } => {
                let result = self.replay_parked().await;
                let _ = reply.send(result);
                Flow::Continue
            },
        }
    }

    fn touch(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.last_heartbeat = Instant::now();
        }
    }

    /// Completes a delivery as acknowledged (or skipped), advancing and
    /// persisting the checkpoint where possible.
    async fn settle(&mut self, token: DeliveryToken) {
        match self.in_flight.complete(token) {
            Some(Completion::Advanced { count, .. }) => self.note_advance(count).await,
            Some(Completion::Replay { position }) => self.delete_parked(position).await,
            Some(Completion::Buffered) | None => {},
        }
    }

    async fn redeliver(&mut self, token: DeliveryToken, reason: &str) -> Flow {
        let Some(attempt) = self.in_flight.attempt_of(token) else {
            return Flow::Continue;
        };

        if attempt > self.options.max_retries {
            self.park(token, reason).await;
            return Flow::Continue;
        }

        let Some(redelivery) = self.in_flight.take_for_retry(token) else {
            return Flow::Continue;
        };

        match self
            .deliver(
                redelivery.position,
                redelivery.attempt,
                redelivery.event,
                redelivery.replayed,
            )
            .await
        {
            DeliverOutcome::Exit => Flow::Exit,
            DeliverOutcome::Delivered | DeliverOutcome::Stop => Flow::Continue,
        }
    }

    /// Records the Event behind a token in the parked table and advances
    /// past it.
    async fn park(&mut self, token: DeliveryToken, reason: &str) {
        let Some(position) = self.in_flight.position_of(token) else {
            return;
        };
        let Some(event) = self.in_flight.event_of(token) else {
            return;
        };
        let (event_id, stream_id) = (event.event_id, event.stream_id.clone());

        let inserted = sqlx::query(&format!(
            r"INSERT INTO {} (subscription_id, position, event_id, stream_id, reason)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (subscription_id, position) DO NOTHING",
            self.store.schema.table("subscription_parked"),
        ))
        .bind(self.subscription_id)
        .bind(position.min(i64::MAX as u64) as i64)
        .bind(event_id)
        .bind(&stream_id)
        .bind(reason)
        .execute(&self.store.pool)
        .await;

        if let Err(error) = inserted {
            tracing::warn!(
                subscription.name = %self.name,
                %error,
                "failed to park event, leaving it in flight"
            );
            return;
        }

        tracing::debug!(
            subscription.name = %self.name,
            event.id = %event_id,
            position,
            reason,
            "event parked"
        );

        match self.in_flight.complete(token) {
            Some(Completion::Advanced { count, .. }) => self.note_advance(count).await,
            Some(Completion::Replay { .. } | Completion::Buffered) | None => {},
        }
    }

    async fn replay_parked(&mut self) -> Result<usize, SubscribeError> {
        let parked: Vec<(i64, Uuid)> = sqlx::query_as(&format!(
            "SELECT position, event_id FROM {} WHERE subscription_id = $1 ORDER BY position",
            self.store.schema.table("subscription_parked"),
        ))
        .bind(self.subscription_id)
        .fetch_all(&self.store.pool)
        .await
        .map_err(|error| anyhow!("failed to load parked events: {error}"))?;

        let select_event = format!(
            r"SELECT e.sequence_number AS position, {EVENT_COLUMNS}
              FROM {events} e
              JOIN {streams} s ON s.id = e.stream_id
              WHERE e.event_id = $1",
            events = self.store.schema.table("events"),
            streams = self.store.schema.table("streams"),
        );

        let mut replayed = 0;
        for (position, event_id) in parked {
            let row = sqlx::query(&select_event)
                .bind(event_id)
                .fetch_optional(&self.store.pool)
                .await
                .map_err(|error| anyhow!("failed to load parked event {event_id}: {error}"))?;

            let Some(row) = row else {
                // The event is gone (its stream was hard-deleted).
                self.delete_parked(position.max(0) as u64).await;
                continue;
            };

            let event = store::positioned_from_row(&row)
                .map_err(SubscribeError::Internal)?
                .event;

            match Box::pin(self.deliver(position.max(0) as u64, 1, event, true)).await {
                DeliverOutcome::Delivered => replayed += 1,
                DeliverOutcome::Stop | DeliverOutcome::Exit => break,
            }
        }

        Ok(replayed)
    }

    async fn delete_parked(&self, position: u64) {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE subscription_id = $1 AND position = $2",
            self.store.schema.table("subscription_parked"),
        ))
        .bind(self.subscription_id)
        .bind(position.min(i64::MAX as u64) as i64)
        .execute(&self.store.pool)
        .await;

        if let Err(error) = result {
            tracing::warn!(
                subscription.name = %self.name,
                position,
                %error,
                "failed to delete parked event record"
            );
        }
    }

    async fn delete_parked_for_stream(&self, stream_id: &str) {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE subscription_id = $1 AND stream_id = $2",
            self.store.schema.table("subscription_parked"),
        ))
        .bind(self.subscription_id)
        .bind(stream_id)
        .execute(&self.store.pool)
        .await;

        if let Err(error) = result {
            tracing::warn!(
                subscription.name = %self.name,
                stream.id = %stream_id,
                %error,
                "failed to delete parked event records for deleted stream"
            );
        }
    }

    async fn attach(&mut self, consumer: ConsumerSlot) {
        let consumer_id = consumer.id;
        self.active = Some(ConsumerSlot {
            last_heartbeat: Instant::now(),
            ..consumer
        });

        // The promoted consumer starts over from the persisted
        // checkpoint: unacknowledged in-flight deliveries of its
        // predecessor are delivered again.
        let last_seen = self.in_flight.last_seen();
        self.in_flight = InFlight::new(self.options.max_in_flight, last_seen);
        self.cursor = last_seen;
        self.set_state(State::CatchingUp).await;

        tracing::debug!(
            subscription.name = %self.name,
            subscription.checkpoint = last_seen,
            consumer.id = consumer_id,
            "consumer attached, catching up from checkpoint"
        );
    }

    async fn consumer_lost(&mut self) {
        self.flush_checkpoint().await;
        self.active = None;

        let last_seen = self.in_flight.last_seen();
        self.in_flight = InFlight::new(self.options.max_in_flight, last_seen);
        self.cursor = last_seen;

        while let Some(next) = self.pending.pop_front() {
            if next.deliveries.is_closed() {
                continue;
            }
            self.attach(next).await;
            return;
        }

        self.set_state(State::Disconnected).await;
    }

    async fn note_advance(&mut self, count: usize) {
        self.advances_since_checkpoint += count;
        if self.advances_since_checkpoint >= self.store.config.checkpoint_batch {
            self.flush_checkpoint().await;
        }
    }

    /// Persists `last_seen`. The statement is idempotent and can only
    /// move the stored checkpoint forward.
    async fn flush_checkpoint(&mut self) {
        if self.advances_since_checkpoint == 0 {
            return;
        }

        let last_seen = self.in_flight.last_seen();

        tracing::debug!(
            subscription.checkpoint = last_seen,
            subscription.name = %self.name,
            "checkpointing subscription"
        );

        let result = sqlx::query(&format!(
            "UPDATE {} SET last_seen = GREATEST(last_seen, $1) WHERE id = $2",
            self.store.schema.table("subscriptions"),
        ))
        .bind(last_seen.min(i64::MAX as u64) as i64)
        .bind(self.subscription_id)
        .execute(&self.store.pool)
        .await;

        if let Err(error) = result {
            tracing::warn!(
                subscription.name = %self.name,
                %error,
                "failed to persist subscription checkpoint"
            );
        }

        self.advances_since_checkpoint = 0;
    }

    async fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        self.state = state;

        tracing::debug!(
            subscription.name = %self.name,
            subscription.state = state.as_str(),
            "subscription state changed"
        );

        let result = sqlx::query(&format!(
            "UPDATE {} SET state = $1 WHERE id = $2",
            self.store.schema.table("subscriptions"),
        ))
        .bind(state.as_str())
        .bind(self.subscription_id)
        .execute(&self.store.pool)
        .await;

        if let Err(error) = result {
            tracing::warn!(
                subscription.name = %self.name,
                %error,
                "failed to persist subscription state"
            );
        }
    }

    async fn delete_subscription(&mut self) -> Result<(), SubscribeError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.store.schema.table("subscriptions"),
        ))
        .bind(self.subscription_id)
        .execute(&self.store.pool)
        .await
        .map_err(|error| anyhow!("failed to delete subscription: {error}"))?;

        Ok(())
    }

    /// An unrecoverable subscription error: detach every consumer, leave
    /// the checkpoint row intact, and stop the worker. Peer subscriptions
    /// are unaffected.
    async fn fail(&mut self) -> Flow {
        self.flush_checkpoint().await;
        self.active = None;
        self.pending.clear();
        self.set_state(State::Disconnected).await;
        Flow::Exit
    }

    async fn shutdown(mut self) {
        self.flush_checkpoint().await;
        if !self.unsubscribed {
            self.set_state(State::Disconnected).await;
        }
        self.store.registry.deregister(&self.target, &self.name);

        tracing::debug!(
            subscription.name = %self.name,
            stream.id = self.target.as_str(),
            "subscription worker stopped"
        );
    }
}
