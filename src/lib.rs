//! # Relay Loop - out-of-process plugin core
//!
//! A host process launches plugin binaries and talks to them over one
//! multiplexed connection per process:
//! - Handle broker: serve local services under handles, dial remote ones
//! - Compose-then-call client connections with rollback on failure
//! - Versioned payloads (JSON v1, JSON v2, deterministic CBOR)
//! - A generic lifecycle contract (name, start, close, ready, health)
//! - Subprocess supervision with keep-alive and relaunch
//!
//! ## Architecture
//!
//! ```text
//!        host process                              plugin process
//!  ┌───────────────────────┐                 ┌───────────────────────┐
//!  │ PluginClient          │   launch +      │ plugin::serve         │
//!  │  (supervisor)         │── handshake ──▶ │                       │
//!  │ ClientConn ─▶ Broker  │◀═══ one mux ══▶ │ Broker ─▶ root Server │
//!  │   (compose, dial)     │   connection    │   (handle 0)          │
//!  └───────────────────────┘                 └───────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod broker;
pub mod clientconn;
pub mod ipc;
pub mod payload;
pub mod plugin;
pub mod process;
pub mod reporting;
pub mod service;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
