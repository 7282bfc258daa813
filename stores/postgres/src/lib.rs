//! PostgreSQL backend for the `everlog` Event Store.
//!
//! Implements the [`everlog::store`] capability traits on top of a
//! [`sqlx::PgPool`]: advisory-locked appends with optimistic concurrency
//! control, a gap-free global log, Event linking, soft/hard Stream
//! deletion, `LISTEN`/`NOTIFY` commit notifications, and durable
//! subscriptions with persistent checkpoints and single-active-consumer
//! failover.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

mod append;
pub mod config;
mod delete;
mod link;
mod listener;
mod read;
pub mod schema;
mod store;
mod subscription;

pub use config::Config;
pub use schema::{Schema, SchemaError, SCHEMA_VERSION};
pub use store::Store;
pub use subscription::Subscription;
