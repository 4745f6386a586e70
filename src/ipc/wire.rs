//! Msgpack helpers for call bodies.
//!
//! Every typed forwarding client marshals its request struct with
//! [`to_body`] and unmarshals the reply with [`from_body`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::Result;

/// Encode a request or reply struct as a msgpack map.
pub fn to_body<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
}

/// Decode a msgpack body.
pub fn from_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Body for calls that carry nothing.
pub fn empty() -> Bytes {
    Bytes::new()
}
