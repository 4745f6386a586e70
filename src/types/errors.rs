//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Errors that cross the process boundary
//! are flattened to an `{code, message}` pair (see [`Error::to_ipc_error_code`])
//! and come back on the calling side as [`Error::Remote`].

use thiserror::Error;

use crate::payload::PayloadError;
use crate::types::ServiceHandle;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// One resource that failed to close during a [`crate::broker::ResourceSet`] close.
#[derive(Debug)]
pub struct CloseFailure {
    /// Name of the resource.
    pub name: String,
    /// Error its closer returned.
    pub error: Error,
}

/// Main error enum for the plugin core.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// A handle could not be resolved into a usable connection.
    #[error("failed to dial {name} (handle {handle}): {reason}")]
    Dial {
        name: String,
        handle: ServiceHandle,
        reason: String,
    },

    /// A local service could not be registered with the broker.
    #[error("failed to serve {name}: {source}")]
    Serve {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// A call addressed a handle that is not (or no longer) in the handle table.
    #[error("unknown handle: {0}")]
    UnknownHandle(ServiceHandle),

    /// Versioned payload errors.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Error reported by the peer process.
    #[error("remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// The multiplexed connection went away while the call was in flight.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The plugin process is not currently running (killed or reconnecting).
    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    /// Handshake with the plugin process failed (wrong binary, bad cookie).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The object was explicitly closed.
    #[error("closed: {0}")]
    Closed(String),

    /// Internal errors (INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation through the stop signal (CANCELLED).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout (DEADLINE_EXCEEDED).
    #[error("timeout: {0}")]
    Timeout(String),

    /// One or more resources failed to close; every member was still attempted.
    #[error("failed to close {}", describe_close_failures(.0))]
    CloseAll(Vec<CloseFailure>),

    /// JSON errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Msgpack encoding errors on the wire.
    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// Msgpack decoding errors on the wire.
    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_close_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.name, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Wire code sent to the peer in an error frame.
    pub fn to_ipc_error_code(&self) -> String {
        let code = match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Dial { .. } | Error::UnknownHandle(_) => "UNKNOWN_HANDLE",
            Error::Payload(PayloadError::InvalidType(_)) => "INVALID_TYPE",
            Error::Payload(PayloadError::UnsupportedVersion(_)) => "UNSUPPORTED_VERSION",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Cancelled(_) => "CANCELLED",
            Error::ConnectionClosed(_) | Error::Unavailable(_) | Error::Closed(_) => {
                "UNAVAILABLE"
            }
            Error::Remote { code, .. } => return code.clone(),
            Error::Serve { source, .. } => return source.to_ipc_error_code(),
            _ => "INTERNAL",
        };
        code.to_string()
    }

    /// True for failures of the connection itself rather than of the call:
    /// the local transport is gone, or the peer no longer knows the handle.
    ///
    /// Only these invalidate a composed client connection.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::ConnectionClosed(_) | Error::Unavailable(_) | Error::UnknownHandle(_) => true,
            Error::Remote { code, .. } => code == "UNKNOWN_HANDLE",
            _ => false,
        }
    }

    /// Wire code of a remote error, if this is one.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Error::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn serve(name: impl Into<String>, source: Error) -> Self {
        Self::Serve {
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn dial(name: impl Into<String>, handle: ServiceHandle, reason: impl ToString) -> Self {
        Self::Dial {
            name: name.into(),
            handle,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::validation("x").to_ipc_error_code(), "INVALID_ARGUMENT");
        assert_eq!(
            Error::UnknownHandle(ServiceHandle::new(7)).to_ipc_error_code(),
            "UNKNOWN_HANDLE"
        );
        assert_eq!(
            Error::from(PayloadError::UnsupportedVersion(9)).to_ipc_error_code(),
            "UNSUPPORTED_VERSION"
        );
        assert_eq!(
            Error::from(PayloadError::InvalidType("bad".into())).to_ipc_error_code(),
            "INVALID_TYPE"
        );
        assert_eq!(Error::connection_closed("eof").to_ipc_error_code(), "UNAVAILABLE");
        assert_eq!(Error::remote("CUSTOM", "m").to_ipc_error_code(), "CUSTOM");
    }

    #[test]
    fn test_serve_error_keeps_name_and_source() {
        let err = Error::serve("B", Error::internal("boom"));
        let msg = err.to_string();
        assert!(msg.contains("B"));
        assert!(msg.contains("boom"));
        assert_eq!(err.to_ipc_error_code(), "INTERNAL");
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::connection_closed("eof").is_transport());
        assert!(Error::unavailable("killed").is_transport());
        assert!(Error::remote("UNKNOWN_HANDLE", "gone").is_transport());
        // The peer answered; whatever it forwarded to is its own business.
        assert!(!Error::remote("UNAVAILABLE", "downstream gone").is_transport());
        assert!(!Error::remote("INTERNAL", "boom").is_transport());
        assert!(!Error::timeout("slow").is_transport());
    }

    #[test]
    fn test_close_all_message_lists_every_failure() {
        let err = Error::CloseAll(vec![
            CloseFailure {
                name: "a".into(),
                error: Error::internal("first"),
            },
            CloseFailure {
                name: "b".into(),
                error: Error::internal("second"),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("a: internal error: first"));
        assert!(msg.contains("b: internal error: second"));
    }
}
