//! Error taxonomy for the WebSocket engine.
//!
//! - [`ProtocolError`]: framing, masking, UTF-8 and size violations (fatal)
//! - [`HandshakeError`]: the HTTP upgrade exchange failed (fatal, never OPEN)
//! - [`WsError`]: everything an operation can return, including caller misuse
//! - [`ErrorInfo`]: the flattened form handed to the observer's error slot

use std::io;

use thiserror::Error;

use crate::close::CloseCode;
use crate::config::ConfigError;
use crate::frame::Opcode;
use crate::state::ReadyState;
use crate::timer::Deadline;

/// A violation of the RFC 6455 wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),
    #[error("non-zero RSV bits without negotiated extensions")]
    ReservedBitsSet,
    #[error("server sent a masked frame")]
    MaskedServerFrame,
    #[error("client sent an unmasked frame")]
    UnmaskedClientFrame,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,
    #[error("payload length {0} not encoded in its minimal form")]
    NonMinimalLength(u64),
    #[error("MSB of 64-bit payload length must be 0")]
    LengthOverflow,
    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: u64, max: u64 },
    #[error("assembled message of {size} bytes exceeds maximum {max}")]
    MessageTooBig { size: usize, max: usize },
    #[error("new data frame while a fragmented message is incomplete")]
    UnexpectedDataFrame,
    #[error("continuation frame without a message in progress")]
    ContinuationWithoutStart,
    #[error("{0:?} frame is not a data frame")]
    NotADataFrame(Opcode),
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    #[error("close frame payload of 1 byte")]
    TruncatedClosePayload,
    #[error("close code {0} is not allowed on the wire")]
    InvalidCloseCode(u16),
}

impl ProtocolError {
    /// The close code sent to the peer when this violation fails the connection.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => CloseCode::INVALID_DATA,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooBig { .. } => {
                CloseCode::MESSAGE_TOO_BIG
            }
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// The server's response did not complete a valid upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("invalid URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: &'static str },
    #[error("invalid subprotocol `{0}`")]
    InvalidSubprotocol(String),
    #[error("header `{0}` is controlled by the handshake")]
    ReservedHeader(String),
    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),
    #[error("response head exceeds {0} bytes")]
    ResponseTooLarge(usize),
    #[error("expected status 101, got {0}")]
    UnexpectedStatus(u16),
    #[error("missing or invalid Upgrade header")]
    MissingUpgrade,
    #[error("missing or invalid Connection header")]
    MissingConnection,
    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,
    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptMismatch { expected: String, actual: String },
    #[error("server selected subprotocol `{0}` which was not offered")]
    SubprotocolNotOffered(String),
    #[error("server selected extension `{0}` which was not offered")]
    ExtensionNotOffered(String),
    #[error("connection closed during handshake")]
    ConnectionClosed,
}

/// Error returned by connection operations.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ReadyState,
    },
    #[error("{0:?} deadline elapsed")]
    Timeout(Deadline),
    #[error("close code {0} may not be sent by the application")]
    InvalidCloseCode(u16),
    #[error("close reason of {0} bytes exceeds 123")]
    ReasonTooLong(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Broad class of a fatal error, as seen by the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Handshake,
    Protocol,
    Timeout,
}

/// Payload of the observer's `error` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// Close code that describes the failure (sent to the peer when possible).
    pub code: u16,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

impl From<&WsError> for ErrorInfo {
    fn from(err: &WsError) -> Self {
        let (kind, code) = match err {
            WsError::Transport(_) => (ErrorKind::Transport, CloseCode::ABNORMAL),
            WsError::Handshake(_) => (ErrorKind::Handshake, CloseCode::ABNORMAL),
            WsError::Protocol(p) => (ErrorKind::Protocol, p.close_code()),
            WsError::Timeout(Deadline::Ping) => (ErrorKind::Timeout, CloseCode::GOING_AWAY),
            WsError::Timeout(_) => (ErrorKind::Timeout, CloseCode::ABNORMAL),
            // Caller misuse never reaches the observer, but keep the mapping total.
            WsError::InvalidState { .. }
            | WsError::InvalidCloseCode(_)
            | WsError::ReasonTooLong(_)
            | WsError::Config(_) => (ErrorKind::Protocol, CloseCode::PROTOCOL_ERROR),
        };
        ErrorInfo::new(kind, code, err.to_string())
    }
}
