//! The serialization boundary of the Store.
//!
//! Event payloads and metadata are opaque bytes to the Store itself;
//! a [`Codec`] implementation is injected by the application to encode
//! values on append and decode them on delivery.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// A [Codec] can be used to encode into and decode from a wire format,
/// such as JSON, a given type.
///
/// Implementations must round-trip: `decode(encode(v)) == v`.
pub trait Codec<T>: Send + Sync {
    /// The error returned by the [`Codec::decode`] method.
    type Error: Send + Sync;

    /// Encodes the given value into the wire format supported by this [Codec].
    fn encode(&self, value: &T) -> Vec<u8>;

    /// Decodes a value from a message encoded in the wire format
    /// supported by this [Codec].
    fn decode(&self, data: &[u8]) -> Result<T, Self::Error>;
}

/// Implements the [Codec] trait using the [serde] crate to encode and
/// decode a value into JSON.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<T>)
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>;

impl<T> Default for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    type Error = serde_json::Error;

    fn encode(&self, value: &T) -> Vec<u8> {
        serde_json::to_vec(value).expect("json serialization should not fail")
    }

    fn decode(&self, data: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(data)
    }
}
