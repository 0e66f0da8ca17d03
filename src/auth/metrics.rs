use super::errors::{AuthError, MetricsErrorKind};
use super::request::AuthRequest;
use crate::ctmap::CtKey;
use serde::Serialize;
use std::time::Duration;

/// Metrics and event sink for authentication propagation.
///
/// All methods have empty default implementations; implement the ones you need.
/// Calls are made from the worker processing the request and must not block.
pub trait MetricsRecorder: Send + Sync + 'static {
    /// A scan pass over all tables has completed.
    fn record_pass(&self) {}

    /// A record was marked as authenticated.
    fn record_match(&self, _map: &str, _key: &CtKey) {}

    /// A request reached a terminal state.
    fn record_outcome(&self, _event: &AuthEvent) {}

    /// An error of the given kind occurred.
    fn record_error(&self, _kind: MetricsErrorKind) {}
}

/// Terminal state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventOutcome {
    /// At least one record was marked, or was found already marked.
    Authenticated,
    /// The attempt budget ran out.
    Exhausted,
    /// A table could not be read.
    Fatal,
    /// The caller cancelled the request.
    Cancelled,
    /// The request deadline passed.
    DeadlineExceeded,
}

/// Structured record of a finished request, suitable for a log or event pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthEvent {
    /// The request.
    pub request: AuthRequest,
    /// How it ended.
    pub outcome: AuthEventOutcome,
    /// Scan passes performed.
    pub attempts: u32,
    /// Records marked as authenticated.
    pub updated: usize,
    /// Matching records found already marked.
    pub already_authenticated: usize,
    /// Per-record write failures over all passes.
    pub update_failures: usize,
    /// Wall time spent on the request.
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    /// Error message for failed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthEventOutcome {
    pub(crate) const fn from_error(err: &AuthError) -> Self {
        match err {
            AuthError::Exhausted { .. } => Self::Exhausted,
            AuthError::Fatal { .. } => Self::Fatal,
            AuthError::Cancelled { .. } => Self::Cancelled,
            AuthError::DeadlineExceeded { .. } => Self::DeadlineExceeded,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}
