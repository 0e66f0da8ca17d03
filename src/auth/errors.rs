use crate::ctmap::CtMapError;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`CtMapAuthenticator`](super::CtMapAuthenticator).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No record for the flow could be marked within the attempt budget.
    ///
    /// The flow is authenticated, but the dataplane could not be told about it.
    #[error("no conntrack entry requiring auth found after {attempts} attempts")]
    Exhausted {
        /// Number of scan passes performed.
        attempts: u32,
    },

    /// A table could not be read; the request was abandoned.
    ///
    /// This is a dataplane error, distinct from [`AuthError::Exhausted`].
    #[error("conntrack scan failed on attempt {attempt}: {source}")]
    Fatal {
        /// The attempt during which the failure occurred (1-based).
        attempt: u32,
        /// The underlying table error.
        #[source]
        source: CtMapError,
    },

    /// The caller cancelled the request.
    #[error("authentication request cancelled after {attempts} attempts")]
    Cancelled {
        /// Number of scan passes completed before cancellation.
        attempts: u32,
    },

    /// The per-request deadline passed before a record was marked.
    #[error("authentication request deadline of {deadline:?} exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// Number of scan passes performed.
        attempts: u32,
        /// The configured deadline.
        deadline: Duration,
    },
}

impl AuthError {
    /// Number of completed scan passes.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts }
            | Self::Cancelled { attempts }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::Fatal { attempt, .. } => attempt.saturating_sub(1),
        }
    }

    /// Metrics label for this error.
    pub const fn kind(&self) -> MetricsErrorKind {
        match self {
            Self::Exhausted { .. } => MetricsErrorKind::Exhausted,
            Self::Fatal { .. } => MetricsErrorKind::ScanFailed,
            Self::Cancelled { .. } => MetricsErrorKind::Cancelled,
            Self::DeadlineExceeded { .. } => MetricsErrorKind::DeadlineExceeded,
        }
    }
}

/// Errors building an [`AuthRequest`](super::AuthRequest).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthRequestError {
    /// Source and destination addresses belong to different families.
    #[error("flow mixes address families: source={source_addr}, dest={dest_addr}")]
    MixedFamilies {
        /// Source address.
        source_addr: IpAddr,
        /// Destination address.
        dest_addr: IpAddr,
    },

    /// The flow carries protocol number zero.
    #[error("flow protocol must be non-zero")]
    ZeroProtocol,
}

/// Error kinds for structured metrics reporting.
///
/// Use these stable, low-cardinality labels when recording metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MetricsErrorKind {
    /// A matched record could not be written back.
    RecordUpdate,
    /// A table could not be opened or dumped.
    ScanFailed,
    /// A pass over all tables found no record to mark.
    NoMatch,
    /// The attempt budget was exhausted.
    Exhausted,
    /// The request was cancelled.
    Cancelled,
    /// The request deadline passed.
    DeadlineExceeded,
    /// A worker task panicked or was aborted.
    WorkerJoinFailed,
}

impl MetricsErrorKind {
    /// Returns a string representation of the error kind.
    ///
    /// This is useful for metrics systems that require string labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecordUpdate => "record_update",
            Self::ScanFailed => "scan_failed",
            Self::NoMatch => "no_match",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::WorkerJoinFailed => "worker_join_failed",
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`AuthManager::submit`](super::AuthManager::submit).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// A request for the same flow is still in flight.
    #[error("authentication already pending for flow {0}")]
    AlreadyPending(crate::ctmap::FlowTuple),

    /// The manager has been shut down.
    #[error("auth manager is closed")]
    Closed,
}

/// Errors returned by [`AuthManager`](super::AuthManager) lifecycle operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManagerError {
    /// Workers did not finish within the shutdown timeout and were aborted.
    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,

    /// The worker ended without reporting an outcome.
    #[error("worker ended without an outcome")]
    WorkerLost,
}
