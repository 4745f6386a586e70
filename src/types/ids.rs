//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque integer naming one registered service instance on one connection.
///
/// Handles are allocated by the broker that serves the instance and are only
/// meaningful to its peer for the lifetime of that connection. `0` is
/// reserved for the plugin's root service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceHandle(u32);

impl ServiceHandle {
    /// Root service of a plugin process.
    pub const ROOT: ServiceHandle = ServiceHandle(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ServiceHandle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}
