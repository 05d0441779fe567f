//! Listener Error Types
//!
//! Transport failures are classified where they originate (from
//! `std::io::ErrorKind`) so the recovery policy never inspects rendered messages.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Result type for listener operations
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Failures on the wire, tagged by kind
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Session returned no envelope
    #[error("No valid response from slave")]
    NoResponse,

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Socket closed locally (teardown in progress)
    #[error("Socket closed: {0}")]
    SocketClosed(String),

    /// Peer reset or dropped the connection
    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    /// Listening port already taken
    #[error("Bind conflict: {0}")]
    BindConflict(String),

    /// Any other IO failure
    #[error("IO error: {0}")]
    Io(String),

    /// Malformed or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replacement connection handler could not be scheduled
    #[error("Listener restart failed: {0}")]
    Restart(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let msg = err.to_string();
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout(msg),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionBroken(msg),
            io::ErrorKind::NotConnected => TransportError::SocketClosed(msg),
            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
                TransportError::BindConflict(msg)
            },
            _ => TransportError::Io(msg),
        }
    }
}

impl TransportError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }

    pub fn socket_closed(msg: impl Into<String>) -> Self {
        TransportError::SocketClosed(msg.into())
    }

    pub fn connection_broken(msg: impl Into<String>) -> Self {
        TransportError::ConnectionBroken(msg.into())
    }

    /// Check if this failure means the connection is dead and the whole
    /// listener stack has to be rebuilt
    pub fn needs_restart(&self) -> bool {
        matches!(self, TransportError::ConnectionBroken(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    pub fn is_socket_closed(&self) -> bool {
        matches!(self, TransportError::SocketClosed(_))
    }
}

/// Caller-facing listener errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Listener could not be stood up
    #[error("Listener init error: {0}")]
    Init(String),

    /// Send attempted without a live slave connection
    #[error("TCP listener has no active connection")]
    NotConnected,

    /// Request/response exchange failed
    #[error("Transport error (slave {slave_id}): {source}")]
    Transport {
        slave_id: u8,
        #[source]
        source: TransportError,
    },

    /// Connection-level failure not tied to a request
    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),

    /// Worker pool still busy after the drain bound
    #[error("Worker pool did not drain within {0:?}")]
    DrainTimeout(Duration),

    /// Invalid request or configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ListenerError {
    pub fn init(msg: impl Into<String>) -> Self {
        ListenerError::Init(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ListenerError::Config(msg.into())
    }

    pub fn transport(slave_id: u8, source: TransportError) -> Self {
        ListenerError::Transport { slave_id, source }
    }

    /// Underlying transport failure, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            ListenerError::Transport { source, .. } => Some(source),
            ListenerError::Connection(source) => Some(source),
            _ => None,
        }
    }
}

/// Sink for failures that must not influence control flow
///
/// Teardown and recovery problems end up here instead of replacing the error
/// the caller is about to see.
pub trait ExceptionHandler: Send + Sync {
    fn received_exception(&self, error: &ListenerError);
}

/// Default handler: log and move on
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn received_exception(&self, error: &ListenerError) {
        warn!("Listener exception: {}", error);
    }
}
