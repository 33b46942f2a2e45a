//! Device watchdog timer (RFC 3539 Section 3.4, single retry)
//!
//! Any traffic on the connection pushes the deadline out by Tw. When the
//! deadline passes a DWR is sent and the deadline moves by the answer
//! timeout; after the second unanswered DWR the connection is declared dead.

use std::time::Duration;

use tokio::time::Instant;

/// Initial DWR plus one retry
pub(crate) const MAX_WATCHDOG_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogAction {
    /// Deadline not reached
    Idle,
    /// Send a DWR now
    SendRequest,
    /// No traffic after the retry; abort the connection
    Expired,
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    interval: Duration,
    answer_timeout: Duration,
    deadline: Instant,
    outstanding: u32,
}

impl Watchdog {
    pub(crate) fn new(interval: Duration, answer_timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            answer_timeout,
            deadline: now + interval,
            outstanding: 0,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn on_traffic(&mut self, now: Instant) {
        self.outstanding = 0;
        self.deadline = now + self.interval;
    }

    pub(crate) fn poll(&mut self, now: Instant) -> WatchdogAction {
        if now < self.deadline {
            return WatchdogAction::Idle;
        }
        if self.outstanding >= MAX_WATCHDOG_ATTEMPTS {
            return WatchdogAction::Expired;
        }
        self.outstanding += 1;
        self.deadline = now + self.answer_timeout;
        WatchdogAction::SendRequest
    }
}
