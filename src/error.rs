//! Error kinds for the protocol core.
//!
//! `ProtocolError` covers the four fatal, connection-terminating kinds
//! plus `ConnectionLost`. `HandlerError` is the sole recoverable kind and
//! is never allowed to propagate as a `ProtocolError` - the dispatcher
//! converts it into a reply envelope or a termination per `ErrorPolicy`.

use std::io;
use thiserror::Error;

/// Fatal, connection-terminating protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0:#04x} (expected 0x01)")]
    BadVersion(u8),

    #[error("preamble checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    Checksum { expected: u8, got: u8 },

    #[error("message encoding error: {0}")]
    Encoding(String),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("no active poll on this connection")]
    NoActivePoll,

    #[error("connection lost")]
    ConnectionLost,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// `true` for the kinds that must terminate the connection outright;
    /// no reply is ever sent for these.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::NoActivePoll)
    }
}

/// Error raised by a `CommandHandler::run` implementation.
///
/// Unlike `ProtocolError`, this is recoverable: per `ErrorPolicy`, the
/// dispatcher may reply with an error envelope and keep the connection
/// open rather than terminate it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Lowercased exception-class-style name, used as the reply
    /// envelope's `"exception"` field.
    pub name: String,
    pub message: String,
    /// Additional fields merged into the error reply envelope.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Policy for what happens to a connection after a `HandlerError`. Fixed
/// per deployment via `ServerConfig`, never decided per-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Reply with an error envelope and keep dispatching (DESIGN.md's
    /// chosen default).
    #[default]
    ReplyAndContinue,
    /// Log and terminate the connection without replying.
    Terminate,
}
