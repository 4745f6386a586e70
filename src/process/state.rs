//! Plugin client state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a supervised plugin process.
///
/// ```text
/// UNSTARTED ──► CONNECTED ◄────────┐
///                  │               │
///                  ▼               │
///               KILLED ──► RECONNECTING
///                  ▲               │
///                  └───────────────┘
///
/// any state ──► CLOSED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unstarted,
    Connected,
    Killed,
    Reconnecting,
    Closed,
}

impl PluginState {
    pub fn is_terminal(self) -> bool {
        self == PluginState::Closed
    }

    /// Calls may be issued.
    pub fn is_available(self) -> bool {
        self == PluginState::Connected
    }

    pub fn can_transition_to(self, to: PluginState) -> bool {
        match (self, to) {
            (PluginState::Closed, _) => false,
            (_, PluginState::Closed) => true,
            (PluginState::Unstarted, PluginState::Connected) => true,
            (PluginState::Connected, PluginState::Killed) => true,
            (PluginState::Killed, PluginState::Reconnecting) => true,
            (PluginState::Reconnecting, PluginState::Connected) => true,
            // relaunch failed
            (PluginState::Reconnecting, PluginState::Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Unstarted => "unstarted",
            PluginState::Connected => "connected",
            PluginState::Killed => "killed",
            PluginState::Reconnecting => "reconnecting",
            PluginState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PluginState::*;

    #[test]
    fn test_lifecycle_path() {
        assert!(Unstarted.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Killed));
        assert!(Killed.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Killed));
    }

    #[test]
    fn test_closed_is_terminal() {
        for from in [Unstarted, Connected, Killed, Reconnecting] {
            assert!(from.can_transition_to(Closed));
        }
        for to in [Unstarted, Connected, Killed, Reconnecting, Closed] {
            assert!(!Closed.can_transition_to(to));
        }
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_invalid_shortcuts() {
        assert!(!Unstarted.can_transition_to(Killed));
        assert!(!Killed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Reconnecting));
    }
}
