//! Core types shared by every layer.
//!
//! - **IDs**: [`ServiceHandle`]
//! - **Errors**: application error type with thiserror derives
//! - **Config**: supervisor, transport, dial, encoding and logging settings

mod config;
mod errors;
mod ids;

pub use config::{
    Config, DialOptions, EncodingConfig, MuxConfig, ObservabilityConfig, SupervisorConfig,
};
pub use errors::{CloseFailure, Error, Result};
pub use ids::ServiceHandle;
