//! TCP+msgpack transport between a host and one plugin process.
//!
//! One connection per plugin process, length-prefixed frames, and a
//! multiplexer that carries every logical service over that connection.

pub mod codec;
pub mod mux;
pub mod wire;

pub use mux::{Dispatcher, Mux};
