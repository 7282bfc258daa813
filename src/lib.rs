//! `everlog` is an append-only Event Store: a strongly-ordered log of
//! Events organized into named Streams, with optimistic concurrency
//! control, a virtual `$all` Stream in global commit order, Event linking
//! without payload duplication, soft/hard Stream deletion, and durable
//! subscriptions with ack-based delivery.
//!
//! This crate contains the storage-agnostic building blocks: the data
//! model, the capability traits implemented by backends, the serialization
//! boundary, the commit-notification bus and the subscription vocabulary.
//! The PostgreSQL backend lives in the `everlog-postgres` crate.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]

pub mod codec;
pub mod event;
pub mod inmemory;
pub mod notify;
pub mod store;
pub mod stream;
pub mod subscription;
pub mod version;
