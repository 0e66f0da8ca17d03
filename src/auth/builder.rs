use super::authenticator::CtMapAuthenticator;
use super::matcher::{FlowMatcher, Matcher};
use super::metrics::MetricsRecorder;
use crate::ctmap::MapSet;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Retry configuration for [`CtMapAuthenticator`].
///
/// A request performs at most `max_attempts` scan passes. Between passes the worker
/// sleeps, starting at `interval`; if `max_interval` is larger the sleep doubles after
/// every empty pass (with small jitter) up to `max_interval`, otherwise it stays fixed.
/// `deadline`, if set, bounds the whole request.
///
/// Durations are (de)serialized as milliseconds:
///
/// ```rust
/// use conntrack_auth::auth::RetryConfig;
/// use std::time::Duration;
///
/// let cfg: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5, "interval_ms": 250}"#)?;
/// assert_eq!(cfg.max_attempts, 5);
/// assert_eq!(cfg.interval, Duration::from_millis(250));
/// assert_eq!(cfg.deadline, None);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of scan passes per request.
    pub max_attempts: u32,
    /// Delay after the first empty pass.
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Upper bound for the delay between passes.
    #[serde(rename = "max_interval_ms", with = "millis")]
    pub max_interval: Duration,
    /// Overall time budget of a request.
    #[serde(rename = "deadline_ms", with = "opt_millis")]
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl RetryConfig {
    /// Normalizes the configuration.
    ///
    /// `max_attempts` is raised to at least 1 and `max_interval` to at least `interval`,
    /// so a config can never skip scanning or shrink its sleep below the base interval.
    pub(crate) fn normalize(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.max_interval = self.max_interval.max(self.interval);
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => super::millis::serialize(d, s),
            None => s.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}

/// Builder for [`CtMapAuthenticator`].
///
/// # Example
///
/// ```rust
/// use conntrack_auth::auth::CtMapAuthenticator;
/// use conntrack_auth::ctmap::memory::InMemoryMapSet;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let authenticator = CtMapAuthenticator::builder(Arc::new(InMemoryMapSet::with_global_maps()))
///     .max_attempts(5)
///     .retry_interval(Duration::from_millis(200))
///     .max_retry_interval(Duration::from_secs(2))
///     .deadline(Some(Duration::from_secs(10)))
///     .build();
/// assert_eq!(authenticator.retry_config().max_attempts, 5);
/// ```
pub struct AuthenticatorBuilder {
    maps: Arc<dyn MapSet>,
    retry: RetryConfig,
    matcher: Arc<dyn Matcher>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Debug for AuthenticatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatorBuilder")
            .field("maps", &"<MapSet>")
            .field("retry", &self.retry)
            .field("matcher", &"<Matcher>")
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl AuthenticatorBuilder {
    /// Creates a builder searching the tables of `maps`.
    pub fn new(maps: Arc<dyn MapSet>) -> Self {
        Self {
            maps,
            retry: RetryConfig::default(),
            matcher: Arc::new(FlowMatcher),
            metrics: None,
        }
    }

    /// Replaces the whole retry configuration.
    #[must_use]
    pub const fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of scan passes per request.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the delay after the first empty pass.
    #[must_use]
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry.interval = interval;
        self
    }

    /// Sets the upper bound of the delay between passes (enables exponential backoff
    /// when larger than the retry interval).
    #[must_use]
    pub const fn max_retry_interval(mut self, max_interval: Duration) -> Self {
        self.retry.max_interval = max_interval;
        self
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub const fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.retry.deadline = deadline;
        self
    }

    /// Replaces the record matcher.
    ///
    /// The default is [`FlowMatcher`].
    #[must_use]
    pub fn matcher<M>(mut self, matcher: M) -> Self
    where
        M: Matcher,
    {
        self.matcher = Arc::new(matcher);
        self
    }

    /// Sets a metrics/event recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the authenticator. The retry configuration is normalized here.
    pub fn build(self) -> CtMapAuthenticator {
        CtMapAuthenticator::from_parts(self.maps, self.retry.normalize(), self.matcher, self.metrics)
    }
}
