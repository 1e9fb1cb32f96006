mod code;
pub use crate::error::code::*;

use std::sync::Arc;
use thiserror::Error;

/// Raconteur's Error type
///
/// Every variant is cheap to clone, since a single connection failure is
/// handed to every send still waiting in the queue.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Socket-level connect/accept/lookup failure, or a closed connection
    #[error("Connection error: {0}")]
    Connection(String),
    /// Malformed frame or inconsistent protocol state
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Malformed argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation not valid in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// A request did not receive its response in time
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Another node already holds this NodeID
    #[error("NodeID already in use: {0}")]
    NodeIdAlreadyInUse(String),
    /// Another node already holds this NodeName
    #[error("NodeName already in use: {0}")]
    NodeNameAlreadyInUse(String),
    /// Operating system resource exhaustion or misconfiguration
    #[error("System resource error: {0}")]
    SystemResource(String),
    /// The requested node could not be located
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    /// Error reported by the remote peer in a response entry
    #[error("Remote error {code:?}: {message}")]
    RemoteError { code: ErrorCode, message: String },
    /// Transparent `postcard` error
    #[error(transparent)]
    Postcard(#[from] postcard::Error),
    /// Transparent std `io` error
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Stable numeric code, suitable for branching and for the wire
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Connection(_) | Error::Io(_) => ErrorCode::ConnectionError,
            Error::Protocol(_) | Error::Postcard(_) => ErrorCode::ProtocolError,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Error::Timeout(_) => ErrorCode::RequestTimeout,
            Error::NodeIdAlreadyInUse(_) => ErrorCode::NodeIdAlreadyInUse,
            Error::NodeNameAlreadyInUse(_) => ErrorCode::NodeNameAlreadyInUse,
            Error::SystemResource(_) => ErrorCode::SystemResourceError,
            Error::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Error::RemoteError { code, .. } => *code,
        }
    }

    /// Rebuild a typed error from a code and message received from a peer
    pub fn from_remote(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::ConnectionError => Error::Connection(message),
            ErrorCode::ProtocolError => Error::Protocol(message),
            ErrorCode::InvalidArgument => Error::InvalidArgument(message),
            ErrorCode::InvalidOperation => Error::InvalidOperation(message),
            ErrorCode::RequestTimeout => Error::Timeout(message),
            ErrorCode::NodeNotFound => Error::NodeNotFound(message),
            code => Error::RemoteError { code, message },
        }
    }

    pub(crate) fn closed() -> Self {
        Error::Connection("Connection closed".into())
    }
}

/// This is the Result type used by raconteur.
pub type Result<T> = ::core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_level() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(e.code(), ErrorCode::ConnectionError);
        let cloned = e.clone();
        assert_eq!(cloned.to_string(), "pipe");
    }

    #[test]
    fn remote_codes_map_back_to_variants() {
        let e = Error::from_remote(ErrorCode::RequestTimeout, "slow");
        assert!(matches!(e, Error::Timeout(_)));
        let e = Error::from_remote(ErrorCode::NodeIdAlreadyInUse, "taken");
        assert!(matches!(
            e,
            Error::RemoteError {
                code: ErrorCode::NodeIdAlreadyInUse,
                ..
            }
        ));
    }
}
