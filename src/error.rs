//! The crate-wide error taxonomy.
//!
//! Each subsystem defines its own narrow error enum (`wire::Error`,
//! `connection::Error`, `waiter::Error`, ...), the same granularity
//! cratetorrent uses for `WriteError`/`NewTorrentError`. This module's
//! [`Error`] is the composite type callers crossing subsystem boundaries
//! see, with `From` impls doing the folding.

use std::fmt;

use crate::{connection, waiter, wire};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top-level error type, spanning every subsystem's failure modes.
#[derive(Debug)]
pub enum Error {
    /// A suspendable operation's deadline elapsed.
    Timeout,
    /// A suspendable operation was cancelled.
    Cancelled,
    /// The operation doesn't make sense in the object's current state.
    NotConnected,
    InvalidOperation(String),
    /// The remote refused the TCP connection.
    ConnectionRefused,
    /// Any other I/O failure.
    Io(std::io::Error),
    /// A wire-protocol framing or decode failure.
    Wire(wire::Error),
    /// All of the available connection legs failed; the message names the
    /// host/user and the cause chain.
    ConnectionError { message: String },
    /// A second `wait()` replaced a still-pending one with the same key.
    Replaced,
    /// A completion arrived for a wait expecting a different type.
    TypeMismatch,
    /// The server refused the login handshake. Terminal for the session.
    LoginRejected(String),
    /// The remote peer refused a transfer request.
    TransferRejected(String),
    /// The local `Resolvers::queue_download` rejected an inbound request.
    QueueDownloadRejected(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::Cancelled => write!(f, "operation was cancelled"),
            Error::NotConnected => write!(f, "connection is not in the Connected state"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Wire(e) => write!(f, "wire protocol error: {}", e),
            Error::ConnectionError { message } => write!(f, "{}", message),
            Error::Replaced => write!(f, "wait was replaced by a newer registration"),
            Error::TypeMismatch => write!(f, "wait completed with a value of the wrong type"),
            Error::LoginRejected(reason) => write!(f, "login rejected: {}", reason),
            Error::TransferRejected(reason) => write!(f, "transfer rejected: {}", reason),
            Error::QueueDownloadRejected(reason) => {
                write!(f, "queue download rejected: {}", reason)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<wire::Error> for Error {
    fn from(e: wire::Error) -> Self {
        Error::Wire(e)
    }
}

impl From<connection::Error> for Error {
    fn from(e: connection::Error) -> Self {
        match e {
            connection::Error::Timeout => Error::Timeout,
            connection::Error::Cancelled => Error::Cancelled,
            connection::Error::Refused => Error::ConnectionRefused,
            connection::Error::NotConnected => Error::NotConnected,
            connection::Error::Io(e) => Error::Io(e),
            connection::Error::WriteFailed(e) => Error::Io(e),
            connection::Error::Wire(e) => Error::Wire(e),
        }
    }
}

impl From<waiter::Error> for Error {
    fn from(e: waiter::Error) -> Self {
        match e {
            waiter::Error::Timeout => Error::Timeout,
            waiter::Error::Cancelled => Error::Cancelled,
            waiter::Error::Replaced => Error::Replaced,
            waiter::Error::TypeMismatch => Error::TypeMismatch,
        }
    }
}

/// Wraps `cause` into a [`Error::ConnectionError`] naming `who` (typically
/// a username or endpoint), for reporting a failed direct-or-indirect
/// connection race as one composite failure.
pub fn connection_error(who: impl fmt::Display, cause: impl fmt::Display) -> Error {
    Error::ConnectionError {
        message: format!(
            "Failed to establish a direct or indirect connection to {}: {}",
            who, cause
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kind_maps_to_specific_variant() {
        let io_err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(Error::from(io_err), Error::ConnectionRefused));

        let io_err = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert!(matches!(Error::from(io_err), Error::Timeout));
    }

    #[test]
    fn connection_error_names_the_target() {
        let err = connection_error("alice", "both legs failed");
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("both legs failed"));
    }
}
