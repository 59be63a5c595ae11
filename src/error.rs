use crate::frame::FrameType;
use crate::transport::EventType;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;
use thiserror::Error;

/// Wire-level error codes carried in ERROR frames.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorCode {
    /// The SETUP frame is invalid for the server (e.g. malformed).
    InvalidSetup = 0x0001,
    /// The server does not support some aspect of the SETUP frame.
    UnsupportedSetup = 0x0002,
    /// The server rejected the SETUP, the client should not retry.
    RejectedSetup = 0x0003,
    /// The server rejected the RESUME, the client must start a fresh session.
    RejectedResume = 0x0004,
    /// The connection is being terminated because of a protocol-level failure.
    ConnectionError = 0x0101,
    /// The connection is being closed deliberately; in-flight requests may be retried elsewhere.
    ConnectionClose = 0x0102,
    /// Application-layer failure on the responder side, scoped to one stream.
    ApplicationError = 0x0201,
    /// The responder refused the request (e.g. lease exhaustion observed remotely).
    Rejected = 0x0202,
    /// The responder acknowledges a requester cancellation.
    Canceled = 0x0203,
    /// The request was syntactically invalid for the responder.
    Invalid = 0x0204,
}

/// Failures of the frame codec. All of these are fatal to the connection: a peer that
///  produces unparseable bytes cannot be trusted to stay in sync.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("frame truncated")]
    Incomplete,
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("unsupported frame type {0:?}")]
    Unsupported(FrameType),
    #[error("reserved bit set in frame header")]
    ReservedBit,
    #[error("metadata length exceeds remaining frame length")]
    MetadataOverrun,
    #[error("{0:?} frame requires stream id 0, got {1}")]
    ExpectedZeroStreamId(FrameType, u32),
    #[error("{0:?} frame requires a non-zero stream id")]
    ExpectedNonZeroStreamId(FrameType),
    #[error("invalid field: {0}")]
    InvalidArgument(&'static str),
}

/// Everything the session surfaces to callers and stream handlers.
///
/// Stream-scoped errors (`Remote`, `Rejected`, `Canceled`) are isolated to their stream;
///  the rest terminate the connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("frame codec: {0}")]
    Frame(#[from] FrameError),
    #[error("transport closed")]
    TransportClosed,
    #[error("no handler registered for {0:?}")]
    NoHandler(EventType),
    #[error("no frame received within the maximum lifetime of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("i/o: {0}")]
    Io(String),
    #[error("error frame [{code:#06x}]: {message}")]
    Remote { code: u32, message: String },
    #[error("request rejected by lease")]
    Rejected,
    #[error("canceled")]
    Canceled,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol violation: {0}")]
    Invalid(String),
}

impl ProtocolError {
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> ProtocolError {
        ProtocolError::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The typed error code of a `Remote` error, if the peer sent a known one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::Remote { code, .. } => ErrorCode::try_from(*code).ok(),
            _ => None,
        }
    }

    /// The wire code this error maps to when it is reported to the peer on a stream.
    pub fn outbound_code(&self) -> ErrorCode {
        match self {
            ProtocolError::Remote { code, .. } => {
                ErrorCode::try_from(*code).unwrap_or(ErrorCode::Invalid)
            }
            ProtocolError::Rejected => ErrorCode::Rejected,
            ProtocolError::Canceled => ErrorCode::Canceled,
            ProtocolError::ConnectionClosed | ProtocolError::TransportClosed => {
                ErrorCode::ConnectionClose
            }
            ProtocolError::Frame(_) => ErrorCode::ConnectionError,
            ProtocolError::Invalid(_) => ErrorCode::Invalid,
            _ => ErrorCode::ApplicationError,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> ProtocolError {
        ProtocolError::Io(e.to_string())
    }
}
