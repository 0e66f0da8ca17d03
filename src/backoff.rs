//! Retry utilities shared by the scanner and the authenticator.
//!
//! This module contains the log-noise suppression used for repeated failures,
//! the cancellable inter-attempt sleep and the backoff policy.

use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Maximum number of consecutive identical errors logged at WARN before
/// further occurrences are downgraded to DEBUG.
///
/// Applies to:
/// - per-record update failures within a scan
/// - passes that find no matching record
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Allocation-free key type for error tracking categories.
///
/// Used by `ErrorTracker` to group failures for log suppression without string
/// literals or heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    /// Writing a matched record back failed.
    RecordUpdate,
    /// A full pass over all tables found nothing to mark.
    NoMatch,
}

/// Helper for tracking repeated errors to suppress log noise.
///
/// Counts consecutive occurrences of the same error kind. For the first N
/// consecutive occurrences of a kind [`ErrorTracker::record_error`] returns `true`
/// and the caller logs at WARN. After that it returns `false` and the caller logs
/// at DEBUG, so a table full of failing writes or a long wait for a record does not
/// flood the log.
///
/// A different kind, or [`ErrorTracker::reset`] after a success, starts a new run.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    /// Creates a tracker that allows `max_consecutive` WARN-level occurrences per run.
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records one occurrence of `error_kind`.
    ///
    /// Returns `true` if the occurrence should be logged at WARN, `false` if the run
    /// has exceeded the threshold and it should be logged at DEBUG.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    /// Ends the current run, e.g. after a successful write.
    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    /// Length of the current run, for DEBUG-level context.
    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Why an inter-attempt sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The full duration elapsed.
    Elapsed,
    /// The cancellation token fired.
    Cancelled,
    /// The deadline was reached before the duration elapsed.
    Deadline,
}

/// Sleeps for `dur`, returning early on cancellation or when `deadline` passes.
pub(crate) async fn sleep_or_cancel(
    token: &CancellationToken,
    dur: Duration,
    deadline: Option<Instant>,
) -> Wake {
    if token.is_cancelled() {
        return Wake::Cancelled;
    }
    match deadline {
        Some(deadline) if deadline <= Instant::now() + dur => {
            tokio::select! {
                () = token.cancelled() => Wake::Cancelled,
                () = sleep_until(deadline) => Wake::Deadline,
            }
        }
        _ => {
            tokio::select! {
                () = token.cancelled() => Wake::Cancelled,
                () = sleep(dur) => Wake::Elapsed,
            }
        }
    }
}

/// Exponential backoff with small jitter.
///
/// Computes the next delay between passes by:
/// 1. Doubling the current duration
/// 2. Clamping to the maximum duration
/// 3. Adding small jitter (0-10% of the base), still clamped
///
/// The jitter keeps many requests submitted together (e.g. after a policy change)
/// from rescanning the tables in lockstep.
///
/// If `max <= current` the interval is returned unchanged, which is how a fixed
/// interval is configured.
///
/// Note: jitter is calculated in milliseconds, so sub-millisecond precision is lost
/// for very small durations.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    if max <= current {
        return current;
    }

    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(add).min(max))
}
