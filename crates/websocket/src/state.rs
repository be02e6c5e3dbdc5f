//! Connection lifecycle as an explicit state plus a pure transition function.
//!
//! ```text
//! CONNECTING --handshake ok--> OPEN --close sent/received--> CLOSING --echo/teardown--> CLOSED
//!     |   \--close()--> CLOSED   |                              |
//!     +--------------------------+------------ fatal -----------+--> FAILED
//! ```
//!
//! CLOSED and FAILED are terminal. Each terminal state is entered by exactly
//! one transition, which emits exactly one terminal event (`Closed` or
//! `Errored`); every input after that is absorbed without events.

use crate::close::CloseInfo;
use crate::error::ErrorInfo;
use crate::reassembly::Message;

/// The connection's lifecycle phase, queryable at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ReadyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReadyState::Closed | ReadyState::Failed)
    }
}

/// Lifecycle event delivered to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened,
    MessageReceived(Message),
    Closing(CloseInfo),
    Closed(CloseInfo),
    Errored(ErrorInfo),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Closed(_) | Event::Errored(_))
    }
}

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    HandshakeSucceeded,
    /// `close()` while CONNECTING.
    Aborted(CloseInfo),
    /// This side sent CLOSE while OPEN.
    CloseSent(CloseInfo),
    /// A CLOSE frame arrived: the peer initiating (OPEN) or echoing (CLOSING).
    CloseReceived(CloseInfo),
    /// The transport was released after the close frames were exchanged.
    TransportReleased(CloseInfo),
    /// Any fatal error: handshake, protocol, transport or timeout.
    Failure(ErrorInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ReadyState,
    pub to: ReadyState,
    pub events: Vec<Event>,
}

impl Transition {
    fn to(from: ReadyState, to: ReadyState, event: Event) -> Self {
        Transition {
            from,
            to,
            events: vec![event],
        }
    }

    fn stay(state: ReadyState) -> Self {
        Transition {
            from: state,
            to: state,
            events: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Compute the next state and the events the move emits.
///
/// Inputs that make no sense in the current state leave it unchanged and
/// emit nothing.
pub fn transition(state: ReadyState, input: Input) -> Transition {
    use ReadyState::*;

    match (state, input) {
        (Closed | Failed, _) => Transition::stay(state),
        (_, Input::Failure(info)) => Transition::to(state, Failed, Event::Errored(info)),

        (Connecting, Input::HandshakeSucceeded) => Transition::to(state, Open, Event::Opened),
        (Connecting, Input::Aborted(info)) => Transition::to(state, Closed, Event::Closed(info)),

        (Open, Input::CloseSent(info)) | (Open, Input::CloseReceived(info)) => {
            Transition::to(state, Closing, Event::Closing(info))
        }
        (Closing, Input::CloseReceived(info)) | (Closing, Input::TransportReleased(info)) => {
            Transition::to(state, Closed, Event::Closed(info))
        }

        _ => Transition::stay(state),
    }
}
