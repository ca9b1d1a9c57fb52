//! Userland readiness tracking.
//!
//! Sockets are registered edge-triggered for both directions once. What the
//! kernel reported is kept in `event` until an I/O attempt hits `WouldBlock`;
//! what the current phase wants to do is kept in `interest`. A step may only
//! touch a socket where the two intersect.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const HUP: Ready = Ready(0b0100);
    pub const ERROR: Ready = Ready(0b1000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let names = [
            (Ready::READABLE, "R"),
            (Ready::WRITABLE, "W"),
            (Ready::HUP, "H"),
            (Ready::ERROR, "E"),
        ];
        for (flag, name) in names {
            if self.contains(flag) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Self {
        let mut ready = Ready::EMPTY;
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready |= Ready::HUP;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        ready
    }
}

/// Interest and recorded events of one socket.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub interest: Ready,
    pub event: Ready,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a kernel notification. Hang-ups and errors make both directions
    /// attemptable so the next I/O call surfaces the failure.
    pub fn record(&mut self, ready: Ready) {
        self.event |= ready;
        if ready.intersects(Ready::HUP | Ready::ERROR) {
            self.event |= Ready::READABLE | Ready::WRITABLE;
        }
    }

    /// Interest and event both present for `ready`.
    pub fn can(&self, ready: Ready) -> bool {
        self.interest.contains(ready) && self.event.contains(ready)
    }

    /// A `WouldBlock` was hit: wait for the next notification.
    pub fn blocked(&mut self, ready: Ready) {
        self.event.remove(ready);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Readiness {{ interest: {:?}, event: {:?} }}", self.interest, self.event)
    }
}
