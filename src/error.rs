//! Error types for nexrpc.

use std::fmt;

/// Error type for nexrpc operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the control transport or thread spawning.
    Io(std::io::Error),
    /// More background threads requested than the Nexus supports.
    TooManyBgThreads { requested: usize, max: usize },
    /// Request-handler registration attempted after the window closed.
    ReqFuncRegistrationClosed(u8),
    /// A handler is already installed for this request type.
    ReqFuncAlreadyRegistered(u8),
    /// The supplied request handler is empty.
    InvalidReqFunc(u8),
    /// A hook is already registered for this endpoint ID.
    HookAlreadyRegistered(u8),
    /// Invalid magic number in a packet header.
    InvalidMagic { expected: u8, got: u8 },
    /// Unknown packet type on the wire.
    InvalidPktType(u8),
    /// Unknown session-management packet kind on the wire.
    InvalidSmPktKind(u8),
    /// Unknown session-management error code on the wire.
    InvalidSmErrType(u8),
    /// Buffer too small.
    BufferTooSmall { required: usize, available: usize },
    /// Hostname exceeds the fixed SM metadata field width.
    HostnameTooLong(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::TooManyBgThreads { requested, max } => {
                write!(f, "{} background threads requested, max {}", requested, max)
            }
            Error::ReqFuncRegistrationClosed(t) => {
                write!(f, "handler registration for request type {} after window closed", t)
            }
            Error::ReqFuncAlreadyRegistered(t) => {
                write!(f, "handler already registered for request type {}", t)
            }
            Error::InvalidReqFunc(t) => write!(f, "empty handler for request type {}", t),
            Error::HookAlreadyRegistered(id) => {
                write!(f, "hook already registered for RPC ID {}", id)
            }
            Error::InvalidMagic { expected, got } => {
                write!(f, "invalid magic: expected {:#x}, got {:#x}", expected, got)
            }
            Error::InvalidPktType(t) => write!(f, "invalid packet type: {}", t),
            Error::InvalidSmPktKind(k) => write!(f, "invalid SM packet kind: {}", k),
            Error::InvalidSmErrType(e) => write!(f, "invalid SM error type: {}", e),
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::HostnameTooLong(len) => write!(f, "hostname of {} bytes too long", len),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for nexrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
