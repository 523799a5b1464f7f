use std::time::Duration;
use tokio::time::Instant;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureVerdict {
    Tolerable,
    Fatal,
}

/// Tracks bursts of failures in the receive loop. A failure that occurs within `window` of the
///  previous failure extends the current streak, otherwise it starts a new streak. A streak that
///  grows beyond `threshold` is fatal.
///
/// NB: Once fatal, the guard stays fatal - the receive loop is expected to stop.
#[derive(Debug)]
pub struct IntensiveFailureGuard {
    threshold: u32,
    window: Duration,
    streak: u32,
    last_failure: Option<Instant>,
}

impl IntensiveFailureGuard {
    pub fn new(threshold: u32, window: Duration) -> IntensiveFailureGuard {
        IntensiveFailureGuard {
            threshold,
            window,
            streak: 0,
            last_failure: None,
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> FailureVerdict {
        if self.streak > self.threshold {
            return FailureVerdict::Fatal;
        }

        self.streak = match self.last_failure {
            Some(prev) if now.saturating_duration_since(prev) <= self.window => self.streak + 1,
            _ => 1,
        };
        self.last_failure = Some(now);

        if self.streak > self.threshold {
            FailureVerdict::Fatal
        }
        else {
            FailureVerdict::Tolerable
        }
    }

    pub fn on_success(&mut self) {
        if self.streak <= self.threshold {
            self.streak = 0;
            self.last_failure = None;
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}
