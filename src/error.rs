//!
//! error.rs
//! Typed errors for the protocol boundary. The participant's
//! normal-to-fallback transition matches on `ProtocolError::Timeout` /
//! `ProtocolError::Refused` rather than on a blanket `Err(_)`, so the
//! decision to fail over to the fail-safe coordinator is a typed state
//! transition, not a catch-all exception handler.
//!
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("connection refused")]
    Refused,

    #[error("read timed out")]
    Timeout,

    #[error("unexpected protocol token, expected {expected}, got {got:?}")]
    UnexpectedToken { expected: String, got: Vec<u8> },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Classifies a raw `io::Error` the way the participant needs to:
    /// as a deadline-exceeded timeout, a connection refusal, or some
    /// other I/O failure.
    pub fn classify(err: io::Error) -> ProtocolError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ProtocolError::Timeout,
            io::ErrorKind::ConnectionRefused => ProtocolError::Refused,
            _ => ProtocolError::Io(err),
        }
    }
}
