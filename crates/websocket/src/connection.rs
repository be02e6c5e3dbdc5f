//! The connection state machine.
//!
//! A [`Connection`] owns the transport, drives the handshake, decodes inbound
//! frames, routes them to the control handler or the reassembler, and
//! reports lifecycle events to its [`Observer`]. Every state change goes
//! through [`state::transition`], so each connection emits exactly one
//! terminal event.
//!
//! The connection is single-threaded: the caller drives the read loop with
//! [`Connection::run_once`] / [`Connection::run`] and calls the send
//! operations between steps. Observer slots run synchronously inside the
//! read step. The only cross-thread entry point is the [`AbortHandle`].
//!
//! Outbound writes block until the transport accepts the whole frame; there
//! is no internal send queue.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::close::{build_close_payload, is_sendable_code, CloseCode, CloseInfo};
use crate::config::WsConfig;
use crate::control::{handle_control, ControlAction, PingWatch};
use crate::entropy::{Entropy, ThreadEntropy};
use crate::error::{ErrorInfo, HandshakeError, ProtocolError, WsError};
use crate::frame::{decode, encode, Decoded, DecodeLimits, Frame, Opcode, MAX_CONTROL_PAYLOAD};
use crate::handshake::{
    build_request, parse_response, validate_response, HandshakeResult, HttpRequest, Uri,
};
use crate::observer::{dispatch, Observer};
use crate::reassembly::{MessageEvent, Reassembler};
use crate::state::{transition, Event, Input, ReadyState};
use crate::timer::{Deadline, DeadlineTimer, Timer};
use crate::transport::{Interrupter, ReadOutcome, Transport};

// ---------------------------------------------------------------------------
// Abort handle
// ---------------------------------------------------------------------------

/// Cancels a connection from another thread.
///
/// While CONNECTING, aborting closes the connection (`Closed` with 1006).
/// In any later state the transport is torn down and the connection fails.
/// A blocked transport read is unblocked immediately when the transport
/// provides an interrupter.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    interrupter: Option<Arc<Interrupter>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(interrupt) = &self.interrupter {
            (**interrupt)();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .field("interruptible", &self.interrupter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A client WebSocket connection.
pub struct Connection<T: Transport, O: Observer> {
    transport: T,
    observer: O,
    config: WsConfig,
    entropy: Box<dyn Entropy>,
    timer: Box<dyn Timer>,

    state: ReadyState,
    uri: Uri,
    request: HttpRequest,
    handshake: Option<HandshakeResult>,

    limits: DecodeLimits,
    /// Bytes read from the transport but not yet consumed.
    inbound: Vec<u8>,
    scratch: Vec<u8>,
    reassembler: Reassembler,
    pings: PingWatch,

    /// The CLOSE this side sent, if any.
    close_sent: Option<CloseInfo>,
    transport_released: bool,
    aborted: Arc<AtomicBool>,
    interrupter: Option<Arc<Interrupter>>,
}

impl<T: Transport, O: Observer> Connection<T, O> {
    /// Start connecting to `uri` over an already established `transport`,
    /// using the thread-local RNG and the system clock.
    ///
    /// Only argument errors (bad URI, subprotocol, header or config) are
    /// returned. Failures after that, including a failed request write,
    /// are reported to the observer and leave the connection FAILED.
    pub fn connect(
        uri: &str,
        transport: T,
        observer: O,
        config: WsConfig,
    ) -> Result<Self, WsError> {
        let uri = Uri::parse(uri)?;
        Self::with_collaborators(
            uri,
            transport,
            observer,
            config,
            Box::new(ThreadEntropy),
            Box::new(DeadlineTimer::system()),
        )
    }

    /// Like [`Connection::connect`] with injected randomness and timer.
    pub fn with_collaborators(
        uri: Uri,
        transport: T,
        observer: O,
        config: WsConfig,
        mut entropy: Box<dyn Entropy>,
        timer: Box<dyn Timer>,
    ) -> Result<Self, WsError> {
        config.validate()?;
        let mut request = build_request(
            &uri,
            &config.subprotocols,
            &config.header_pairs(),
            entropy.as_mut(),
        )?;
        request.offer_extensions(&config.extensions);

        let interrupter = transport.interrupter().map(Arc::new);
        let mut conn = Connection {
            limits: DecodeLimits::from_server(config.max_frame_size),
            scratch: vec![0; config.read_buffer_size],
            reassembler: Reassembler::new(config.max_message_size),
            transport,
            observer,
            config,
            entropy,
            timer,
            state: ReadyState::Connecting,
            uri,
            request,
            handshake: None,
            inbound: Vec::new(),
            pings: PingWatch::default(),
            close_sent: None,
            transport_released: false,
            aborted: Arc::new(AtomicBool::new(false)),
            interrupter,
        };
        conn.start_handshake();
        Ok(conn)
    }

    fn start_handshake(&mut self) {
        debug!(uri = %self.uri, key = %self.request.key, "sending upgrade request");
        let bytes = self.request.to_bytes();
        if let Err(e) = self.transport.write(&bytes) {
            self.fail(WsError::Transport(e));
            return;
        }
        self.timer
            .schedule(Deadline::Handshake, self.config.handshake_timeout());
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Subprotocol selected by the server, once OPEN.
    pub fn protocol(&self) -> Option<&str> {
        self.handshake.as_ref().and_then(|h| h.protocol.as_deref())
    }

    /// Extensions the server accepted, once OPEN.
    pub fn extensions(&self) -> &[String] {
        self.handshake
            .as_ref()
            .map_or(&[][..], |h| h.extensions.as_slice())
    }

    pub fn url(&self) -> &Uri {
        &self.uri
    }

    /// Always 0: sends block until the transport accepts the bytes.
    pub fn buffered_amount(&self) -> usize {
        0
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.aborted),
            interrupter: self.interrupter.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Read loop
    // -----------------------------------------------------------------------

    /// Drive the connection until it reaches CLOSED or FAILED.
    pub fn run(&mut self) -> ReadyState {
        loop {
            let state = self.run_once();
            if state.is_terminal() {
                return state;
            }
        }
    }

    /// Perform one transport read and dispatch every complete frame it
    /// yields. Expired deadlines and aborts are handled before and after
    /// the read. Returns the resulting state.
    pub fn run_once(&mut self) -> ReadyState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.check_abort() || self.check_deadlines() {
            return self.state;
        }

        let outcome = self.transport.read(&mut self.scratch);
        if self.check_abort() {
            return self.state;
        }
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                trace!(bytes = n, "read");
                self.inbound.extend_from_slice(&self.scratch[..n]);
                self.process_inbound();
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Closed) => self.on_transport_eof(),
            Err(e) => self.fail(WsError::Transport(e)),
        }

        self.check_deadlines();
        self.state
    }

    /// Returns true when the abort flag ended the connection.
    fn check_abort(&mut self) -> bool {
        if !self.aborted.load(Ordering::SeqCst) || self.state.is_terminal() {
            return false;
        }
        if self.state == ReadyState::Connecting {
            debug!("handshake aborted");
            self.release_transport();
            self.apply(Input::Aborted(CloseInfo::internal(
                CloseCode::ABNORMAL,
                "connection aborted",
            )));
        } else {
            self.fail(WsError::Transport(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection aborted",
            )));
        }
        true
    }

    /// Returns true when an expired deadline ended the connection.
    fn check_deadlines(&mut self) -> bool {
        while let Some(deadline) = self.timer.expired() {
            self.on_deadline(deadline);
            if self.state.is_terminal() {
                return true;
            }
        }
        false
    }

    fn on_deadline(&mut self, deadline: Deadline) {
        match (deadline, self.state) {
            (Deadline::Handshake, ReadyState::Connecting) => {
                self.fail(WsError::Timeout(Deadline::Handshake))
            }
            (Deadline::Ping, ReadyState::Open | ReadyState::Closing) if self.pings.is_pending() => {
                self.fail(WsError::Timeout(Deadline::Ping))
            }
            (Deadline::CloseEcho, ReadyState::Closing) => {
                warn!("peer never echoed close");
                self.release_transport();
                self.apply(Input::TransportReleased(CloseInfo::internal(
                    CloseCode::ABNORMAL,
                    "close handshake timed out",
                )));
            }
            _ => trace!(?deadline, state = ?self.state, "stale deadline"),
        }
    }

    fn on_transport_eof(&mut self) {
        match self.state {
            ReadyState::Connecting => self.fail(WsError::Handshake(HandshakeError::ConnectionClosed)),
            ReadyState::Open => self.fail(WsError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed without a close frame",
            ))),
            ReadyState::Closing => {
                debug!("transport closed before close echo");
                self.release_transport();
                self.apply(Input::TransportReleased(CloseInfo::internal(
                    CloseCode::ABNORMAL,
                    "connection closed before close echo",
                )));
            }
            ReadyState::Closed | ReadyState::Failed => {}
        }
    }

    fn process_inbound(&mut self) {
        if self.state == ReadyState::Connecting && !self.complete_handshake() {
            return;
        }

        let mut offset = 0;
        while matches!(self.state, ReadyState::Open | ReadyState::Closing) {
            let decoded = decode(&self.inbound[offset..], &self.limits);
            match decoded {
                Ok(Decoded::Frame { frame, consumed }) => {
                    offset += consumed;
                    self.on_frame(frame);
                }
                Ok(Decoded::Incomplete { .. }) => break,
                Err(e) => {
                    self.fail(WsError::Protocol(e));
                    break;
                }
            }
        }

        if self.state.is_terminal() {
            self.inbound.clear();
        } else {
            self.inbound.drain(..offset);
        }
    }

    /// Try to finish the handshake from the buffered bytes. Returns true
    /// once the connection is OPEN; leftover bytes stay buffered as frames.
    fn complete_handshake(&mut self) -> bool {
        let parsed = parse_response(&self.inbound, self.config.max_handshake_response);
        let (response, head_len) = match parsed {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return false,
            Err(e) => {
                self.fail(WsError::Handshake(e));
                return false;
            }
        };

        let result = match validate_response(&self.request, &response) {
            Ok(result) => result,
            Err(e) => {
                self.fail(WsError::Handshake(e));
                return false;
            }
        };

        debug!(
            protocol = ?result.protocol,
            extensions = ?result.extensions,
            "handshake complete"
        );
        self.inbound.drain(..head_len);
        self.limits.allow_reserved_bits = !result.extensions.is_empty();
        self.handshake = Some(result);
        self.timer.cancel(Deadline::Handshake);
        self.apply(Input::HandshakeSucceeded);
        self.state == ReadyState::Open
    }

    fn on_frame(&mut self, frame: Frame) {
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");

        if frame.opcode.is_control() {
            match handle_control(self.state, &frame, &mut self.pings) {
                Ok(action) => self.perform(action),
                Err(e) => self.fail(WsError::Protocol(e)),
            }
            return;
        }

        match self.reassembler.on_frame(frame) {
            Ok(MessageEvent::Pending) => {}
            Ok(MessageEvent::Complete(message)) => {
                self.emit(Event::MessageReceived(message))
            }
            Err(e) => self.fail(WsError::Protocol(e)),
        }
    }

    fn perform(&mut self, action: ControlAction) {
        match action {
            ControlAction::SendPong(payload) => {
                let _ = self.write_frame(Frame::new(Opcode::Pong, payload));
            }
            ControlAction::Pong { satisfied } => {
                if satisfied {
                    self.timer.cancel(Deadline::Ping);
                }
            }
            ControlAction::EchoClose { echo_code, info } => {
                debug!(code = info.code, reason = %info.reason, "peer initiated close");
                let echo = Frame::new(Opcode::Close, build_close_payload(echo_code, ""));
                if self.write_frame(echo).is_err() {
                    return;
                }
                self.close_sent = Some(CloseInfo::internal(echo_code, ""));
                self.apply(Input::CloseReceived(info.clone()));
                self.release_transport();
                self.apply(Input::TransportReleased(info));
            }
            ControlAction::CloseAcknowledged(received) => {
                let info = received
                    .or_else(|| self.close_sent.clone())
                    .unwrap_or_else(CloseInfo::normal);
                debug!(code = info.code, "close acknowledged");
                self.release_transport();
                self.apply(Input::CloseReceived(info));
            }
            ControlAction::Ignore => {}
        }
    }

    // -----------------------------------------------------------------------
    // Application operations
    // -----------------------------------------------------------------------

    pub fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.send_data(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.send_data(Opcode::Binary, data)
    }

    fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        self.require_open("send")?;

        let threshold = self.config.fragment_threshold;
        if threshold == 0 || payload.len() <= threshold {
            return self.write_frame(Frame::new(opcode, payload));
        }

        let count = payload.len().div_ceil(threshold);
        trace!(len = payload.len(), fragments = count, "fragmenting message");
        for (i, chunk) in payload.chunks(threshold).enumerate() {
            let op = if i == 0 { opcode } else { Opcode::Continuation };
            self.write_frame(Frame::new(op, chunk).with_fin(i + 1 == count))?;
        }
        Ok(())
    }

    /// Send a PING and arm the ping deadline. Any PONG that arrives before
    /// the deadline satisfies it.
    pub fn ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.require_open("ping")?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(payload.len()).into());
        }
        self.write_frame(Frame::new(Opcode::Ping, payload))?;
        self.pings.arm(payload);
        self.timer.schedule(Deadline::Ping, self.config.ping_timeout());
        Ok(())
    }

    /// Close the connection.
    ///
    /// While CONNECTING this aborts the handshake and emits `Closed`. While
    /// OPEN it sends CLOSE and waits for the peer's echo. In every other
    /// state it does nothing. The code must be 1000 or 3000-4999 and the
    /// reason at most 123 bytes.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        let info = CloseInfo::new(code, reason)?;
        match self.state {
            ReadyState::Connecting => {
                debug!(code, "close while connecting");
                self.release_transport();
                self.apply(Input::Aborted(info));
            }
            ReadyState::Open => {
                debug!(code, reason, "initiating close");
                let frame = Frame::new(Opcode::Close, build_close_payload(code, reason));
                self.write_frame(frame)?;
                self.close_sent = Some(info.clone());
                self.timer
                    .schedule(Deadline::CloseEcho, self.config.close_timeout());
                self.apply(Input::CloseSent(info));
            }
            ReadyState::Closing | ReadyState::Closed | ReadyState::Failed => {}
        }
        Ok(())
    }

    fn require_open(&self, operation: &'static str) -> Result<(), WsError> {
        if self.state != ReadyState::Open {
            return Err(WsError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Mask, encode and write one frame. A write failure fails the
    /// connection; the caller gets an equivalent error back.
    fn write_frame(&mut self, frame: Frame) -> Result<(), WsError> {
        let frame = frame.with_mask(self.entropy.mask_key());
        let bytes = encode(&frame)?;
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "write");
        if let Err(e) = self.transport.write(&bytes) {
            let returned = io::Error::new(e.kind(), e.to_string());
            self.fail(WsError::Transport(e));
            return Err(WsError::Transport(returned));
        }
        Ok(())
    }

    /// Fail the connection: best-effort CLOSE when a WebSocket exists and
    /// the transport still works, then teardown and the `Errored` event.
    fn fail(&mut self, err: WsError) {
        if self.state.is_terminal() {
            return;
        }
        let info = ErrorInfo::from(&err);
        warn!(code = info.code, kind = ?info.kind, error = %err, "connection failed");

        let can_send = matches!(self.state, ReadyState::Open | ReadyState::Closing)
            && self.close_sent.is_none()
            && !matches!(err, WsError::Transport(_))
            && !self.transport_released
            && is_sendable_code(info.code);
        if can_send {
            let frame = Frame::new(Opcode::Close, build_close_payload(info.code, ""))
                .with_mask(self.entropy.mask_key());
            if let Ok(bytes) = encode(&frame) {
                let _ = self.transport.write(&bytes);
            }
        }

        self.release_transport();
        self.apply(Input::Failure(info));
    }

    fn release_transport(&mut self) {
        for deadline in [Deadline::Handshake, Deadline::Ping, Deadline::CloseEcho] {
            self.timer.cancel(deadline);
        }
        self.pings.clear();
        self.reassembler.reset();
        if !self.transport_released {
            self.transport.close();
            self.transport_released = true;
        }
    }

    fn apply(&mut self, input: Input) {
        let t = transition(self.state, input);
        if t.changed() {
            debug!(from = ?t.from, to = ?t.to, "state transition");
        }
        self.state = t.to;
        for event in t.events {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: Event) {
        dispatch(&mut self.observer, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::FixedEntropy;
    use crate::handshake::compute_accept_key;
    use crate::observer::EventLog;
    use crate::timer::ManualClock;
    use crate::transport::{MemoryHandle, MemoryTransport};

    fn connection(config: WsConfig) -> (Connection<MemoryTransport, EventLog>, MemoryHandle) {
        let (transport, handle) = MemoryTransport::new();
        let conn = Connection::with_collaborators(
            Uri::parse("ws://example.com/chat").unwrap(),
            transport,
            EventLog::new(),
            config,
            Box::new(FixedEntropy::new((0u8..16).collect::<Vec<_>>())),
            Box::new(DeadlineTimer::new(ManualClock::new())),
        )
        .unwrap();
        (conn, handle)
    }

    fn accept(conn: &Connection<MemoryTransport, EventLog>, handle: &MemoryHandle) {
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(&conn.request().key)
        );
        handle.push(response);
    }

    #[test]
    fn test_request_written_on_construction() {
        let (conn, handle) = connection(WsConfig::default());
        let sent = String::from_utf8(handle.take_outbound()).unwrap();
        assert!(sent.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(sent.contains("Sec-WebSocket-Key: AAECAwQFBgcICQoLDA0ODw==\r\n"));
        assert_eq!(conn.ready_state(), ReadyState::Connecting);
        assert_eq!(conn.buffered_amount(), 0);
    }

    #[test]
    fn test_handshake_opens() {
        let (mut conn, handle) = connection(WsConfig::default());
        accept(&conn, &handle);
        assert_eq!(conn.run_once(), ReadyState::Open);
        assert_eq!(conn.observer().events, vec![Event::Opened]);
        assert_eq!(conn.protocol(), None);
        assert!(conn.extensions().is_empty());
    }

    #[test]
    fn test_send_before_open_is_invalid_state() {
        let (mut conn, handle) = connection(WsConfig::default());
        handle.take_outbound();
        let err = conn.send_text("early").unwrap_err();
        assert!(matches!(
            err,
            WsError::InvalidState {
                operation: "send",
                state: ReadyState::Connecting
            }
        ));
        assert!(handle.take_outbound().is_empty());
        assert_eq!(conn.ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn test_fragmented_send_sequencing() {
        let config = WsConfig {
            fragment_threshold: 4,
            ..WsConfig::default()
        };
        let (mut conn, handle) = connection(config);
        accept(&conn, &handle);
        conn.run_once();
        handle.take_outbound();

        conn.send_binary(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        let out = handle.take_outbound();
        let limits = DecodeLimits {
            sender: crate::frame::Sender::Client,
            max_frame_size: 1024,
            allow_reserved_bits: false,
        };
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < out.len() {
            match decode(&out[offset..], &limits).unwrap() {
                Decoded::Frame { frame, consumed } => {
                    offset += consumed;
                    frames.push(frame);
                }
                Decoded::Incomplete { .. } => panic!("truncated output"),
            }
        }
        let shape: Vec<_> = frames.iter().map(|f| (f.opcode, f.fin, f.payload.len())).collect();
        assert_eq!(
            shape,
            vec![
                (Opcode::Binary, false, 4),
                (Opcode::Continuation, false, 4),
                (Opcode::Continuation, true, 2),
            ]
        );
        assert!(frames.iter().all(|f| f.is_masked()));
    }

    #[test]
    fn test_close_arguments_validated_without_side_effects() {
        let (mut conn, handle) = connection(WsConfig::default());
        accept(&conn, &handle);
        conn.run_once();
        handle.take_outbound();

        assert!(matches!(conn.close(1006, ""), Err(WsError::InvalidCloseCode(1006))));
        let long = "x".repeat(124);
        assert!(matches!(conn.close(1000, &long), Err(WsError::ReasonTooLong(124))));
        assert_eq!(conn.ready_state(), ReadyState::Open);
        assert!(handle.take_outbound().is_empty());
    }

    #[test]
    fn test_abort_handle_while_connecting() {
        let (mut conn, handle) = connection(WsConfig::default());
        let abort = conn.abort_handle();
        abort.abort();
        assert!(handle.is_closed());
        assert_eq!(conn.run_once(), ReadyState::Closed);
        let log = conn.observer();
        assert_eq!(log.terminal_count(), 1);
        assert!(matches!(
            &log.events[..],
            [Event::Closed(info)] if info.code == CloseCode::ABNORMAL
        ));
    }

    #[test]
    fn test_oversized_ping_refused() {
        let (mut conn, handle) = connection(WsConfig::default());
        accept(&conn, &handle);
        conn.run_once();
        let err = conn.ping(&[0; 126]).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolError::ControlFrameTooLarge(126))
        ));
        assert_eq!(conn.ready_state(), ReadyState::Open);
    }
}
