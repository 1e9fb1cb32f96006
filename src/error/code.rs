use core::fmt::{Display, Formatter};
use serde::*;

/// Numeric error codes carried in `MessageEntry::error`
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    ConnectionError = 1,
    ProtocolError = 2,
    InvalidArgument = 3,
    InvalidOperation = 4,
    RequestTimeout = 5,
    NodeIdAlreadyInUse = 6,
    NodeNameAlreadyInUse = 7,
    SystemResourceError = 8,
    NodeNotFound = 9,
    UnknownError = 100,
}

impl ErrorCode {
    pub fn is_error(&self) -> bool {
        *self != ErrorCode::None
    }
}

impl std::error::Error for ErrorCode {}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        use ErrorCode::*;
        match *self {
            None => write!(f, "No error"),
            ConnectionError => write!(f, "Connection error"),
            ProtocolError => write!(f, "Protocol error"),
            InvalidArgument => write!(f, "Invalid argument"),
            InvalidOperation => write!(f, "Invalid operation"),
            RequestTimeout => write!(f, "Request timed out"),
            NodeIdAlreadyInUse => write!(f, "NodeID already in use"),
            NodeNameAlreadyInUse => write!(f, "NodeName already in use"),
            SystemResourceError => write!(f, "System resource error"),
            NodeNotFound => write!(f, "Node not found"),
            UnknownError => write!(f, "Unknown error"),
        }
    }
}
