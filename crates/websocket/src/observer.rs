//! Observer interface: the `onopen` / `onmessage` / `onclose` / `onerror`
//! slots of the browser object, invoked synchronously from the connection's
//! read-dispatch step in strict event order.
//!
//! Every slot defaults to a no-op, like an unset callback. Besides custom
//! implementations, events can be forwarded over a `crossbeam_channel`
//! (a single tagged-event channel consumed by a caller-driven loop) or
//! recorded with [`EventLog`].

use crossbeam_channel::Sender;

use crate::close::CloseInfo;
use crate::error::ErrorInfo;
use crate::reassembly::Message;
use crate::state::Event;

pub trait Observer {
    fn on_open(&mut self) {}
    fn on_message(&mut self, _message: Message) {}
    /// The closing handshake started (either side sent CLOSE).
    fn on_closing(&mut self, _info: &CloseInfo) {}
    fn on_close(&mut self, _info: CloseInfo) {}
    fn on_error(&mut self, _error: ErrorInfo) {}
}

/// Route one event to its slot.
pub fn dispatch<O: Observer + ?Sized>(observer: &mut O, event: Event) {
    match event {
        Event::Opened => observer.on_open(),
        Event::MessageReceived(message) => observer.on_message(message),
        Event::Closing(info) => observer.on_closing(&info),
        Event::Closed(info) => observer.on_close(info),
        Event::Errored(error) => observer.on_error(error),
    }
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn on_open(&mut self) {
        (**self).on_open()
    }
    fn on_message(&mut self, message: Message) {
        (**self).on_message(message)
    }
    fn on_closing(&mut self, info: &CloseInfo) {
        (**self).on_closing(info)
    }
    fn on_close(&mut self, info: CloseInfo) {
        (**self).on_close(info)
    }
    fn on_error(&mut self, error: ErrorInfo) {
        (**self).on_error(error)
    }
}

/// Forwards every event as-is. A dropped receiver is ignored.
impl Observer for Sender<Event> {
    fn on_open(&mut self) {
        let _ = self.send(Event::Opened);
    }
    fn on_message(&mut self, message: Message) {
        let _ = self.send(Event::MessageReceived(message));
    }
    fn on_closing(&mut self, info: &CloseInfo) {
        let _ = self.send(Event::Closing(info.clone()));
    }
    fn on_close(&mut self, info: CloseInfo) {
        let _ = self.send(Event::Closed(info));
    }
    fn on_error(&mut self, error: ErrorInfo) {
        let _ = self.send(Event::Errored(error));
    }
}

/// Records events in arrival order.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    pub events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn terminal_count(&self) -> usize {
        self.events.iter().filter(|e| e.is_terminal()).count()
    }
}

impl Observer for EventLog {
    fn on_open(&mut self) {
        self.events.push(Event::Opened);
    }
    fn on_message(&mut self, message: Message) {
        self.events.push(Event::MessageReceived(message));
    }
    fn on_closing(&mut self, info: &CloseInfo) {
        self.events.push(Event::Closing(info.clone()));
    }
    fn on_close(&mut self, info: CloseInfo) {
        self.events.push(Event::Closed(info));
    }
    fn on_error(&mut self, error: ErrorInfo) {
        self.events.push(Event::Errored(error));
    }
}
