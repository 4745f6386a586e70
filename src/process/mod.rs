//! Plugin process supervision.
//!
//! - [`PluginClient`]: launch, keep-alive, relaunch, and the `kill`/`reset`
//!   test hooks
//! - [`PluginState`]: the client state machine
//! - [`Handshake`]: per-family magic cookie and the handshake line
//! - [`EnvConfig`]: environment surface passed to plugin processes

pub mod env;
mod handshake;
mod launcher;
mod state;
mod supervisor;

pub use env::EnvConfig;
pub use handshake::{Handshake, CORE_PROTOCOL_VERSION};
pub use launcher::{launch, LaunchConfig, Launched};
pub use state::PluginState;
pub use supervisor::{PluginClient, PluginConfig};
