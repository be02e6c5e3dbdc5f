//! Clock/timer collaborator for the handshake, ping and close-echo deadlines.
//!
//! The connection never sleeps: it schedules deadlines, cancels them when the
//! awaited event happens, and asks for [`Timer::expired`] after every read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// The deadlines a connection can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// The server's 101 response must arrive in time.
    Handshake,
    /// An outstanding ping must be answered by a pong.
    Ping,
    /// After sending CLOSE, the peer's echo must arrive.
    CloseEcho,
}

impl Deadline {
    fn slot(self) -> usize {
        match self {
            Deadline::Handshake => 0,
            Deadline::Ping => 1,
            Deadline::CloseEcho => 2,
        }
    }

    const ALL: [Deadline; 3] = [Deadline::Handshake, Deadline::Ping, Deadline::CloseEcho];
}

/// Schedule-a-deadline / cancel-a-deadline operations.
pub trait Timer: Send {
    /// Arm (or re-arm) `deadline` to fire `after` from now.
    fn schedule(&mut self, deadline: Deadline, after: Duration);
    /// Disarm `deadline`; a no-op if it is not armed.
    fn cancel(&mut self, deadline: Deadline);
    /// Disarm and return the earliest deadline that has passed, if any.
    fn expired(&mut self) -> Option<Deadline>;
}

/// Wall-clock time source.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// [`Timer`] over any [`Clock`], one slot per [`Deadline`].
#[derive(Debug)]
pub struct DeadlineTimer<C = SystemClock> {
    clock: C,
    slots: [Option<Instant>; 3],
}

impl DeadlineTimer<SystemClock> {
    pub fn system() -> Self {
        DeadlineTimer::new(SystemClock)
    }
}

impl<C: Clock> DeadlineTimer<C> {
    pub fn new(clock: C) -> Self {
        DeadlineTimer {
            clock,
            slots: [None; 3],
        }
    }

    pub fn is_armed(&self, deadline: Deadline) -> bool {
        self.slots[deadline.slot()].is_some()
    }
}

impl<C: Clock> Timer for DeadlineTimer<C> {
    fn schedule(&mut self, deadline: Deadline, after: Duration) {
        self.slots[deadline.slot()] = Some(self.clock.now() + after);
    }

    fn cancel(&mut self, deadline: Deadline) {
        self.slots[deadline.slot()] = None;
    }

    fn expired(&mut self) -> Option<Deadline> {
        let now = self.clock.now();
        let due = Deadline::ALL
            .into_iter()
            .filter_map(|d| self.slots[d.slot()].filter(|at| *at <= now).map(|at| (at, d)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, d)| d)?;
        self.slots[due.slot()] = None;
        Some(due)
    }
}
