//! Fragmented message reassembly (RFC 6455 Section 5.4).
//!
//! A message is one initial frame (Text or Binary, FIN may be 0) followed by
//! zero or more Continuation frames, the last with FIN=1. Control frames may
//! be interleaved between fragments; the connection routes them elsewhere and
//! only data frames reach [`Reassembler::on_frame`].
//!
//! Text payloads are UTF-8 checked as fragments arrive, so a message that is
//! already invalid fails without waiting for its final fragment. A code point
//! split across a fragment boundary is fine until the message ends.

use crate::error::ProtocolError;
use crate::frame::{Frame, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A reassembled application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Text(s) => s.as_bytes(),
            Message::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            Message::Binary(_) => None,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(s) => s.into_bytes(),
            Message::Binary(b) => b,
        }
    }
}

/// Result of feeding one data frame to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// Still accumulating fragments.
    Pending,
    /// A complete message is ready.
    Complete(Message),
}

/// Stateful accumulator for one in-flight message.
#[derive(Debug)]
pub struct Reassembler {
    /// Kind of the message in progress. None = not in a fragment sequence.
    kind: Option<MessageKind>,
    buffer: Vec<u8>,
    /// Length of the buffer prefix already known to be valid UTF-8.
    validated: usize,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            kind: None,
            buffer: Vec::new(),
            validated: 0,
            max_message_size,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.kind.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.kind = None;
        self.buffer.clear();
        self.validated = 0;
    }

    /// Feed one data frame. Any error leaves the reassembler reset.
    pub fn on_frame(&mut self, frame: Frame) -> Result<MessageEvent, ProtocolError> {
        let result = self.accept(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn accept(&mut self, frame: Frame) -> Result<MessageEvent, ProtocolError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.is_assembling() {
                    return Err(ProtocolError::UnexpectedDataFrame);
                }
                self.kind = Some(if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                });
            }
            Opcode::Continuation => {
                if !self.is_assembling() {
                    return Err(ProtocolError::ContinuationWithoutStart);
                }
            }
            other => return Err(ProtocolError::NotADataFrame(other)),
        }

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooBig {
                size,
                max: self.max_message_size,
            });
        }
        self.buffer.extend_from_slice(&frame.payload);
        if self.kind == Some(MessageKind::Text) {
            self.check_utf8(frame.fin)?;
        }

        if !frame.fin {
            return Ok(MessageEvent::Pending);
        }
        Ok(MessageEvent::Complete(self.finish()?))
    }

    /// Validate the not-yet-checked tail of the buffer. A truncated code
    /// point at the end is only an error once the message is complete.
    fn check_utf8(&mut self, complete: bool) -> Result<(), ProtocolError> {
        match std::str::from_utf8(&self.buffer[self.validated..]) {
            Ok(_) => self.validated = self.buffer.len(),
            Err(e) if e.error_len().is_none() && !complete => self.validated += e.valid_up_to(),
            Err(_) => return Err(ProtocolError::InvalidUtf8),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Message, ProtocolError> {
        let payload = std::mem::take(&mut self.buffer);
        let kind = self.kind.take();
        self.validated = 0;
        match kind {
            Some(MessageKind::Text) => String::from_utf8(payload)
                .map(Message::Text)
                .map_err(|_| ProtocolError::InvalidUtf8),
            _ => Ok(Message::Binary(payload)),
        }
    }
}
