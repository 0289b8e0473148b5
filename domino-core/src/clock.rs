use std::time::{Duration, Instant};

use crate::Seat;

/// Outcome of a turn deadline elapsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockExpiry {
    /// The seat's one-shot grace allowance absorbed the expiry; the deadline
    /// has been extended and no action is forced yet.
    GraceGranted { until: Instant },
    /// The turn is forfeit to the timer; exactly one forced action follows.
    Forced,
}

/// Per-turn countdown bookkeeping. The clock holds no task of its own; the
/// match runner arms it at each turn start and reacts to `deadline()`.
/// Grace allowances are consumed on first expiry and never replenished.
#[derive(Clone, Debug)]
pub struct TurnClock {
    turn_duration: Duration,
    grace_duration: Duration,
    grace_remaining: Vec<u32>,
    deadline: Option<Instant>,
}

impl TurnClock {
    pub fn new(
        turn_duration: Duration,
        grace_count: u32,
        grace_duration: Duration,
        seats: usize,
    ) -> Self {
        TurnClock {
            turn_duration,
            grace_duration,
            grace_remaining: vec![grace_count; seats],
            deadline: None,
        }
    }

    /// (Re)arm the countdown for a new turn.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.turn_duration);
    }

    /// Stop the countdown, e.g. once the match is over.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn grace_remaining(&self, seat: Seat) -> u32 {
        self.grace_remaining.get(seat).copied().unwrap_or(0)
    }

    /// Handle the current turn holder's deadline elapsing.
    pub fn on_expiry(&mut self, seat: Seat, now: Instant) -> ClockExpiry {
        if let Some(remaining) = self.grace_remaining.get_mut(seat) {
            if *remaining > 0 {
                *remaining -= 1;
                let until = now + self.grace_duration;
                self.deadline = Some(until);
                return ClockExpiry::GraceGranted { until };
            }
        }
        self.deadline = None;
        ClockExpiry::Forced
    }
}
