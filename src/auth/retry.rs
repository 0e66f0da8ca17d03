use super::builder::RetryConfig;
use crate::backoff::next_backoff;
use std::time::Duration;

/// Where a request stands in its retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Scanning; more passes may follow.
    Searching,
    /// A pass marked (or found marked) the flow's record.
    Matched,
    /// The attempt budget is used up without a match.
    Exhausted,
}

/// Per-request retry bookkeeping.
///
/// `attempts` only grows and never exceeds `max_attempts`; once the phase leaves
/// `Searching` no further pass may begin.
#[derive(Debug)]
pub(crate) struct RetryState {
    attempts: u32,
    max_attempts: u32,
    phase: Phase,
    backoff: Duration,
    max_backoff: Duration,
}

impl RetryState {
    pub(crate) fn new(cfg: &RetryConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: cfg.max_attempts.max(1),
            phase: Phase::Searching,
            backoff: cfg.interval,
            max_backoff: cfg.max_interval,
        }
    }

    /// Starts the next pass and returns its 1-based number.
    ///
    /// Returns `None` if no pass may begin.
    pub(crate) fn begin_attempt(&mut self) -> Option<u32> {
        if self.phase != Phase::Searching || self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Records the result of the pass just finished and returns the new phase.
    pub(crate) fn finish_attempt(&mut self, matched: bool) -> Phase {
        if self.phase == Phase::Searching {
            self.phase = if matched {
                Phase::Matched
            } else if self.attempts >= self.max_attempts {
                Phase::Exhausted
            } else {
                Phase::Searching
            };
        }
        self.phase
    }

    /// Delay to wait before the next pass.
    pub(crate) fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Grows the delay for the pass after next.
    pub(crate) fn advance_backoff(&mut self) {
        self.backoff = next_backoff(self.backoff, self.max_backoff);
    }

    /// Passes started so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn allows_exactly_max_attempts() {
        let mut state = RetryState::new(&cfg(3));
        for expected in 1..=3 {
            assert_eq!(state.begin_attempt(), Some(expected));
            let phase = state.finish_attempt(false);
            if expected < 3 {
                assert_eq!(phase, Phase::Searching);
            } else {
                assert_eq!(phase, Phase::Exhausted);
            }
        }
        assert_eq!(state.begin_attempt(), None);
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn matched_is_terminal() {
        let mut state = RetryState::new(&cfg(5));
        state.begin_attempt();
        assert_eq!(state.finish_attempt(true), Phase::Matched);
        assert_eq!(state.begin_attempt(), None);
        // A later miss cannot move the state out of Matched.
        assert_eq!(state.finish_attempt(false), Phase::Matched);
        assert_eq!(state.phase(), Phase::Matched);
    }

    #[test]
    fn fixed_interval_by_default() {
        let mut state = RetryState::new(&RetryConfig::default());
        state.advance_backoff();
        state.advance_backoff();
        assert_eq!(state.backoff(), Duration::from_secs(1));
    }
}
