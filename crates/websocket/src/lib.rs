//! RFC 6455 WebSocket client engine modeled on the browser `WebSocket`
//! object.
//!
//! The crate performs the opening handshake, frames and masks outbound
//! messages, reassembles and validates inbound ones, answers control frames,
//! and reports the lifecycle through four observer slots (`open`,
//! `message`, `close`, `error`). I/O, time and randomness are injected
//! collaborators, so every protocol path runs deterministically in tests.
//!
//! ## Modules
//!
//! - `frame` -- wire codec
//! - `handshake` -- HTTP Upgrade request/response
//! - `reassembly` -- fragmented message assembly and UTF-8 validation
//! - `control` -- PING/PONG/CLOSE responses
//! - `close` -- close codes and payloads
//! - `state` -- ReadyState and the pure transition function
//! - `connection` -- the state machine tying it together
//! - `transport`, `timer`, `entropy` -- collaborators
//! - `observer` -- event slots
//! - `config`, `error`

pub mod close;
pub mod config;
pub mod connection;
pub mod control;
pub mod entropy;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod observer;
pub mod reassembly;
pub mod state;
pub mod timer;
pub mod transport;

pub use close::{CloseCode, CloseInfo};
pub use config::{ConfigError, WsConfig};
pub use connection::{AbortHandle, Connection};
pub use entropy::{Entropy, FixedEntropy, ThreadEntropy};
pub use error::{ErrorInfo, ErrorKind, HandshakeError, ProtocolError, WsError};
pub use frame::{Frame, Opcode};
pub use handshake::Uri;
pub use observer::{EventLog, Observer};
pub use reassembly::{Message, MessageKind};
pub use state::{Event, ReadyState};
pub use timer::{Clock, Deadline, DeadlineTimer, ManualClock, SystemClock, Timer};
pub use transport::{MemoryHandle, MemoryTransport, ReadOutcome, TcpTransport, Transport};
