//! Configuration structures.
//!
//! Configuration is loaded from a JSON file or built from defaults. Every
//! section is optional in the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::payload::EncodingVersion;
use crate::types::Result;

/// Global host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Subprocess supervision.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Multiplexed transport.
    #[serde(default)]
    pub mux: MuxConfig,

    /// Handle dialing.
    #[serde(default)]
    pub dial: DialOptions,

    /// Versioned payload defaults.
    #[serde(default)]
    pub encoding: EncodingConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Subprocess supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Keep-alive tick: liveness probe while connected, relaunch while killed.
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// How long a launched process has to print its handshake line.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,

    /// Upper bound on a remote `Close` acknowledgement.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(1),
            start_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Multiplexed transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Write timeout in seconds per frame. A peer that cannot accept a
    /// frame within this window is treated as gone.
    pub write_timeout_secs: u64,

    /// Capacity of the outbound frame queue shared by all callers.
    pub outbound_capacity: usize,

    /// Close the connection after serving this many incoming calls.
    pub call_limit: Option<u64>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            write_timeout_secs: 10,
            outbound_capacity: 256,
            call_limit: None,
        }
    }
}

/// Options applied when resolving handles into connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// Deadline for the liveness ping that validates a handle.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Default deadline applied to every call on a dialed connection.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Current versions used when writing payloads. Readers always honor the
/// tag of the payload they receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Version used to encode call parameters.
    pub params: EncodingVersion,

    /// Version used to encode return values.
    pub returns: EncodingVersion,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            params: EncodingVersion::Cbor,
            returns: EncodingVersion::Cbor,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
