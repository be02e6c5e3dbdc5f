//! Close frame payloads and status codes (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`CloseInfo`]: code + reason carried by a close frame and the terminal event
//! - [`parse_close_payload`]: Strictly parse a received close payload
//! - [`build_close_payload`]: Build a close payload from code + reason
//! - [`is_valid_received_code`] / [`is_valid_application_code`]: code range checks

use crate::error::{ProtocolError, WsError};

/// Longest reason that fits a control frame next to the 2-byte code.
pub const MAX_REASON_LEN: usize = 123;

/// Well-known WebSocket close status codes per RFC 6455 Section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Going away (1001) -- used when the peer stops answering pings.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (1002).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data (1003).
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// No status code present (1005). Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (1006). Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data (1007) -- UTF-8 failure.
    pub const INVALID_DATA: u16 = 1007;
    /// Policy violation (1008).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big (1009).
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal server error (1011).
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Status code and reason of a closing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Build a close info for the application, enforcing the code range the
    /// browser object accepts (1000 or 3000-4999) and the reason length.
    pub fn new(code: u16, reason: impl Into<String>) -> Result<Self, WsError> {
        let reason = reason.into();
        if !is_valid_application_code(code) {
            return Err(WsError::InvalidCloseCode(code));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(WsError::ReasonTooLong(reason.len()));
        }
        Ok(CloseInfo { code, reason })
    }

    /// Close info for internally generated events; no validation.
    pub(crate) fn internal(code: u16, reason: impl Into<String>) -> Self {
        CloseInfo {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        CloseInfo::internal(CloseCode::NORMAL, "")
    }
}

/// Codes a peer may legitimately put in a close frame.
pub fn is_valid_received_code(code: u16) -> bool {
    matches!(code, 1000..=1011 | 3000..=4999)
}

/// Codes that may appear in a close frame this side sends. 1004 is
/// reserved; 1005 and 1006 only describe a closure locally.
pub fn is_sendable_code(code: u16) -> bool {
    is_valid_received_code(code)
        && !matches!(code, 1004 | CloseCode::NO_STATUS | CloseCode::ABNORMAL)
}

/// Codes an application may pass to `close()`.
pub fn is_valid_application_code(code: u16) -> bool {
    code == CloseCode::NORMAL || (3000..=4999).contains(&code)
}

/// Parse a received close frame payload.
///
/// - empty payload: `Ok(None)` -- no status code present (1005)
/// - 1 byte: protocol error
/// - otherwise: 2-byte big-endian code, which must be in the legal received
///   range, followed by a reason that must be valid UTF-8
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseInfo>, ProtocolError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::TruncatedClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_received_code(code) {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            Ok(Some(CloseInfo { code, reason }))
        }
    }
}

/// Build a close frame payload from a status code and reason string.
///
/// The reason is truncated to [`MAX_REASON_LEN`] bytes, backing off to a
/// character boundary so the payload stays valid UTF-8.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut cut = reason.len().min(MAX_REASON_LEN);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut payload = Vec::with_capacity(2 + cut);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..cut]);
    payload
}
