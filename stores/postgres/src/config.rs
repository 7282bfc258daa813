//! Runtime configuration of the PostgreSQL-backed Store.

use std::time::Duration;

use everlog::subscription::{Options, StartFrom};

/// Configuration for a [`Store`][crate::Store] instance.
///
/// All values have working defaults; use the `with_*` methods to override
/// the ones relevant to your deployment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Optional schema name, allowing multiple independent Stores in the
    /// same database. `None` uses the `public` schema.
    pub schema: Option<String>,

    /// Whether [`DeleteMode::Hard`][everlog::store::DeleteMode::Hard]
    /// deletions are allowed. Off by default.
    pub enable_hard_deletes: bool,

    /// Number of Events fetched per page by the paging readers and by
    /// subscription catch-up.
    pub read_batch_size: usize,

    /// Default in-flight window size for subscriptions.
    pub max_in_flight: usize,

    /// Default retry budget for nacked deliveries before parking.
    pub max_retries: u32,

    /// Default time a delivery may stay unacknowledged before it is
    /// redelivered.
    pub ack_timeout: Duration,

    /// Time without a consumer heartbeat after which the consumer is
    /// considered gone and the subscription fails over.
    pub consumer_timeout: Duration,

    /// Cadence of the automatic heartbeats sent by subscription handles.
    pub consumer_heartbeat_interval: Duration,

    /// Upper bound on a single append (or delete) round-trip.
    pub append_timeout: Duration,

    /// Upper bound on a single read round-trip.
    pub read_timeout: Duration,

    /// Number of acknowledged window advances between checkpoint writes.
    /// `1` persists the checkpoint on every advance.
    pub checkpoint_batch: usize,

    /// Capacity of the in-process notification bus.
    pub notification_buffer: usize,

    /// How often live subscriptions poll the log head when no
    /// notifications arrive.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: None,
            enable_hard_deletes: false,
            read_batch_size: 1000,
            max_in_flight: 100,
            max_retries: 3,
            ack_timeout: Duration::from_secs(30),
            consumer_timeout: Duration::from_secs(15),
            consumer_heartbeat_interval: Duration::from_secs(5),
            append_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            checkpoint_batch: 1,
            notification_buffer: 128,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Places all store tables under the given schema instead of `public`.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Allows hard deletions of Event Streams.
    #[must_use]
    pub fn with_hard_deletes(mut self) -> Self {
        self.enable_hard_deletes = true;
        self
    }

    /// Overrides the read page size.
    #[must_use]
    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size.max(1);
        self
    }

    /// Overrides the default subscription in-flight window size.
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Overrides the default retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Overrides the acknowledgement timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Overrides the consumer heartbeat cadence and failover timeout.
    #[must_use]
    pub fn with_consumer_timeouts(mut self, heartbeat: Duration, timeout: Duration) -> Self {
        self.consumer_heartbeat_interval = heartbeat;
        self.consumer_timeout = timeout;
        self
    }

    /// Overrides the checkpoint batching factor.
    #[must_use]
    pub fn with_checkpoint_batch(mut self, batch: usize) -> Self {
        self.checkpoint_batch = batch.max(1);
        self
    }

    /// Default subscription [Options] derived from this configuration.
    #[must_use]
    pub fn subscription_options(&self) -> Options {
        Options {
            start_from: StartFrom::Origin,
            max_in_flight: self.max_in_flight,
            max_retries: self.max_retries,
            ack_timeout: self.ack_timeout,
            exclusive: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = Config::default();

        assert!(config.schema.is_none());
        assert!(!config.enable_hard_deletes);
        assert_eq!(config.read_batch_size, 1000);
        assert_eq!(config.checkpoint_batch, 1);
    }

    #[test]
    fn subscription_options_inherit_the_store_defaults() {
        let config = Config::default()
            .with_max_in_flight(16)
            .with_max_retries(5);

        let options = config.subscription_options();
        assert_eq!(options.max_in_flight, 16);
        assert_eq!(options.max_retries, 5);
        assert!(!options.exclusive);
    }

    #[test]
    fn zero_valued_overrides_are_clamped() {
        let config = Config::default()
            .with_read_batch_size(0)
            .with_max_in_flight(0)
            .with_checkpoint_batch(0);

        assert_eq!(config.read_batch_size, 1);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.checkpoint_batch, 1);
    }
}
