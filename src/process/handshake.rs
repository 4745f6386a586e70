//! Plugin handshake.
//!
//! The host passes the family's magic cookie to the child in an environment
//! variable. A child that finds the right cookie binds a loopback listener and
//! prints one line on stdout:
//!
//! ```text
//! CORE_VERSION|APP_VERSION|tcp|ADDR|mux
//! ```
//!
//! Any mismatch is fatal: the host never attaches to a binary of the wrong
//! family or protocol.

use std::net::SocketAddr;

use crate::types::{Error, Result};

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

const NETWORK: &str = "tcp";
const PROTOCOL: &str = "mux";

/// Per-family handshake agreed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub cookie_key: &'static str,
    pub cookie_value: &'static str,
}

impl Handshake {
    pub const RELAYER: Handshake = Handshake {
        protocol_version: 1,
        cookie_key: "RELAY_LOOP_RELAYER_MAGIC_COOKIE",
        cookie_value: "9f0d2c1a6e5b4f3c8a7d1e2f0b3c4d5e",
    };

    pub const MEDIAN: Handshake = Handshake {
        protocol_version: 1,
        cookie_key: "RELAY_LOOP_MEDIAN_MAGIC_COOKIE",
        cookie_value: "4a8b9c0d1e2f3a4b5c6d7e8f9a0b1c2d",
    };

    pub const MERCURY: Handshake = Handshake {
        protocol_version: 1,
        cookie_key: "RELAY_LOOP_MERCURY_MAGIC_COOKIE",
        cookie_value: "e1d2c3b4a5968778695a4b3c2d1e0f9a",
    };

    pub const REPORTING: Handshake = Handshake {
        protocol_version: 1,
        cookie_key: "RELAY_LOOP_REPORTING_PLUGIN_MAGIC_COOKIE",
        cookie_value: "2b7e151628aed2a6abf7158809cf4f3c",
    };

    pub const LOGGER_TEST: Handshake = Handshake {
        protocol_version: 1,
        cookie_key: "RELAY_LOOP_LOGGER_TEST_MAGIC_COOKIE",
        cookie_value: "00112233445566778899aabbccddeeff",
    };

    /// Environment entry the host sets on the child.
    pub fn cookie_env(&self) -> (&'static str, &'static str) {
        (self.cookie_key, self.cookie_value)
    }

    /// Check the cookie a child process received.
    pub fn verify_cookie(&self, value: Option<&str>) -> Result<()> {
        match value {
            Some(v) if v == self.cookie_value => Ok(()),
            Some(_) => Err(Error::handshake(format!(
                "{} does not match; this binary is a plugin for a different host",
                self.cookie_key
            ))),
            None => Err(Error::handshake(format!(
                "{} is not set; this binary is a plugin and must be launched by its host",
                self.cookie_key
            ))),
        }
    }

    /// Line a child prints once it listens on `addr`.
    pub fn announce(&self, addr: SocketAddr) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            CORE_PROTOCOL_VERSION, self.protocol_version, NETWORK, addr, PROTOCOL
        )
    }

    /// Parse a child's handshake line, returning the address to connect to.
    pub fn parse_announcement(&self, line: &str) -> Result<SocketAddr> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, addr, protocol] = parts.as_slice() else {
            return Err(Error::handshake(format!("malformed handshake line: {:?}", line)));
        };

        let core: u32 = core
            .parse()
            .map_err(|_| Error::handshake(format!("bad core version: {:?}", core)))?;
        if core != CORE_PROTOCOL_VERSION {
            return Err(Error::handshake(format!(
                "core protocol version {} (want {})",
                core, CORE_PROTOCOL_VERSION
            )));
        }

        let app: u32 = app
            .parse()
            .map_err(|_| Error::handshake(format!("bad app version: {:?}", app)))?;
        if app != self.protocol_version {
            return Err(Error::handshake(format!(
                "plugin protocol version {} (want {})",
                app, self.protocol_version
            )));
        }

        if *network != NETWORK {
            return Err(Error::handshake(format!("unsupported network: {}", network)));
        }
        if *protocol != PROTOCOL {
            return Err(Error::handshake(format!("unsupported protocol: {}", protocol)));
        }

        addr.parse()
            .map_err(|_| Error::handshake(format!("bad address: {:?}", addr)))
    }
}
