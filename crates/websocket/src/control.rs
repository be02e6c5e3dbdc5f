//! Control frame handling (RFC 6455 Section 5.5).
//!
//! Decides the protocol response to each PING, PONG and CLOSE independently
//! of application message flow. The connection performs the returned
//! [`ControlAction`]; this module never touches the transport.
//!
//! - PING: answer with a PONG carrying the same payload, unless terminated
//! - PONG: satisfies the outstanding ping watch; unsolicited ones are ignored
//! - CLOSE while OPEN: validate, then echo the code (1000 when the peer
//!   sent none or one that may not go on the wire) and start closing
//! - CLOSE while CLOSING: the peer's echo of our CLOSE

use tracing::debug;

use crate::close::{is_sendable_code, parse_close_payload, CloseCode, CloseInfo};
use crate::error::ProtocolError;
use crate::frame::{Frame, Opcode};
use crate::state::ReadyState;

/// What the connection must do about a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    SendPong(Vec<u8>),
    /// A PONG arrived; `satisfied` when it answered an outstanding ping.
    Pong { satisfied: bool },
    /// The peer started closing: send CLOSE with `echo_code`, report `info`.
    EchoClose { echo_code: u16, info: CloseInfo },
    /// The peer echoed our CLOSE.
    CloseAcknowledged(Option<CloseInfo>),
    Ignore,
}

/// Tracks the single outstanding application ping.
#[derive(Debug, Default)]
pub struct PingWatch {
    outstanding: Option<Vec<u8>>,
}

impl PingWatch {
    pub fn arm(&mut self, payload: &[u8]) {
        self.outstanding = Some(payload.to_vec());
    }

    pub fn is_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn clear(&mut self) {
        self.outstanding = None;
    }

    /// Record a PONG. Any PONG answers the outstanding ping, even one whose
    /// payload differs. Returns whether a ping was outstanding.
    pub fn on_pong(&mut self, payload: &[u8]) -> bool {
        match self.outstanding.take() {
            Some(expected) => {
                if expected != payload {
                    debug!(
                        expected = expected.len(),
                        got = payload.len(),
                        "pong payload differs from ping"
                    );
                }
                true
            }
            None => false,
        }
    }
}

/// Decide how to respond to one control frame received in `state`.
///
/// A malformed CLOSE payload is the only error; the caller fails the
/// connection with the error's close code.
pub fn handle_control(
    state: ReadyState,
    frame: &Frame,
    pings: &mut PingWatch,
) -> Result<ControlAction, ProtocolError> {
    if state.is_terminal() {
        return Ok(ControlAction::Ignore);
    }

    match frame.opcode {
        Opcode::Ping => Ok(ControlAction::SendPong(frame.payload.clone())),
        Opcode::Pong => Ok(ControlAction::Pong {
            satisfied: pings.on_pong(&frame.payload),
        }),
        Opcode::Close => {
            let received = parse_close_payload(&frame.payload)?;
            match state {
                ReadyState::Open => {
                    let echo_code = received
                        .as_ref()
                        .map(|c| c.code)
                        .filter(|&code| is_sendable_code(code))
                        .unwrap_or(CloseCode::NORMAL);
                    let info = received
                        .unwrap_or_else(|| CloseInfo::internal(CloseCode::NO_STATUS, ""));
                    Ok(ControlAction::EchoClose { echo_code, info })
                }
                ReadyState::Closing => Ok(ControlAction::CloseAcknowledged(received)),
                _ => Ok(ControlAction::Ignore),
            }
        }
        Opcode::Continuation | Opcode::Text | Opcode::Binary => Ok(ControlAction::Ignore),
    }
}
