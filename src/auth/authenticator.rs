use super::builder::{AuthenticatorBuilder, RetryConfig};
use super::errors::{AuthError, MetricsErrorKind};
use super::matcher::Matcher;
use super::metrics::{AuthEvent, AuthEventOutcome, MetricsRecorder};
use super::request::AuthRequest;
use super::retry::{Phase, RetryState};
use crate::backoff::{sleep_or_cancel, ErrorKey, ErrorTracker, Wake, MAX_CONSECUTIVE_SAME_ERROR};
use crate::ctmap::{enumerate, scan, EntryPatch, MapSet, ScanSummary};
use crate::prelude::{debug, error, info, warn};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Successful outcome of [`CtMapAuthenticator::mark_authenticated`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthSuccess {
    /// Scan passes performed, including the successful one.
    pub attempts: u32,
    /// Records marked as authenticated by this request.
    pub updated: usize,
    /// Records of the flow that were already marked.
    pub already_authenticated: usize,
}

/// Marks connection-tracking records as authenticated.
///
/// For each request the authenticator repeatedly enumerates the tables of the flow's
/// address family, streams every record through the [`Matcher`] and sets `AUTH_OK` on
/// the records it selects. A pass that marks nothing is retried after a delay, because
/// authentication may complete before the dataplane has created the record. The loop
/// ends when a pass succeeds, the attempt budget runs out, the deadline passes, the
/// caller cancels, or a table cannot be read.
///
/// The authenticator holds no per-request state; clones share configuration and can
/// process different requests concurrently.
///
/// # Example
///
/// ```rust
/// use conntrack_auth::auth::{AuthRequest, CtMapAuthenticator};
/// use conntrack_auth::ctmap::memory::InMemoryMapSet;
/// use conntrack_auth::ctmap::{CtEntry, CtFlags, CtKey, FlowTuple, MapKind, TupleFlags, IPPROTO_TCP};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let maps = Arc::new(InMemoryMapSet::with_global_maps());
/// let flow = FlowTuple {
///     source_addr: "10.0.0.1".parse()?,
///     dest_addr: "10.0.0.2".parse()?,
///     source_port: 41000,
///     dest_port: 443,
///     protocol: IPPROTO_TCP,
/// };
/// let key = CtKey::from_tuple(&flow, TupleFlags::OUT).ok_or("mixed families")?;
/// let table = maps.global(MapKind::IPV4_TCP).ok_or("missing table")?;
/// table.insert(key, CtEntry { flags: CtFlags::AUTH_REQUIRED, ..CtEntry::default() });
///
/// let authenticator = CtMapAuthenticator::new(maps);
/// let done = authenticator.mark_authenticated(&AuthRequest::new(flow)?).await?;
/// assert_eq!(done.updated, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CtMapAuthenticator {
    inner: Arc<Inner>,
}

struct Inner {
    maps: Arc<dyn MapSet>,
    retry: RetryConfig,
    matcher: Arc<dyn Matcher>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Debug for CtMapAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtMapAuthenticator")
            .field("retry", &self.inner.retry)
            .field(
                "metrics",
                &self.inner.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish_non_exhaustive()
    }
}

/// Totals accumulated over all passes of one request.
#[derive(Debug, Default)]
struct Totals {
    scans: ScanSummary,
    already_authenticated: usize,
}

/// Result of a single pass over all tables.
#[derive(Debug, Default)]
struct Pass {
    tables: usize,
    summary: ScanSummary,
    already_authenticated: usize,
}

impl Pass {
    fn satisfied(&self) -> bool {
        self.summary.updated > 0 || self.summary.unchanged > 0 || self.already_authenticated > 0
    }
}

impl CtMapAuthenticator {
    /// Creates an authenticator with the default configuration.
    pub fn new(maps: Arc<dyn MapSet>) -> Self {
        Self::builder(maps).build()
    }

    /// Returns a builder for an authenticator searching the tables of `maps`.
    pub fn builder(maps: Arc<dyn MapSet>) -> AuthenticatorBuilder {
        AuthenticatorBuilder::new(maps)
    }

    pub(super) fn from_parts(
        maps: Arc<dyn MapSet>,
        retry: RetryConfig,
        matcher: Arc<dyn Matcher>,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                maps,
                retry,
                matcher,
                metrics,
            }),
        }
    }

    /// The normalized retry configuration in use.
    pub fn retry_config(&self) -> RetryConfig {
        self.inner.retry
    }

    /// Marks the records of the requested flow as authenticated.
    ///
    /// Equivalent to [`mark_authenticated_with_cancel`](Self::mark_authenticated_with_cancel)
    /// with a token that is never cancelled.
    ///
    /// # Errors
    ///
    /// See [`mark_authenticated_with_cancel`](Self::mark_authenticated_with_cancel).
    pub async fn mark_authenticated(&self, req: &AuthRequest) -> Result<AuthSuccess, AuthError> {
        self.mark_authenticated_with_cancel(req, &CancellationToken::new())
            .await
    }

    /// Marks the records of the requested flow as authenticated, stopping early if
    /// `cancel` fires.
    ///
    /// Succeeds as soon as a pass marks at least one record of the flow, or finds one
    /// already marked. Records of other flows are never touched.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Exhausted`] if `max_attempts` passes found nothing to mark.
    /// - [`AuthError::Fatal`] if a table exists but could not be read.
    /// - [`AuthError::Cancelled`] if `cancel` fired.
    /// - [`AuthError::DeadlineExceeded`] if the configured deadline passed.
    pub async fn mark_authenticated_with_cancel(
        &self,
        req: &AuthRequest,
        cancel: &CancellationToken,
    ) -> Result<AuthSuccess, AuthError> {
        let started = Instant::now();
        let mut totals = Totals::default();

        let result = self.run(req, cancel, started, &mut totals).await;

        self.report(req, &result, &totals, started.elapsed());
        result
    }

    async fn run(
        &self,
        req: &AuthRequest,
        cancel: &CancellationToken,
        started: Instant,
        totals: &mut Totals,
    ) -> Result<AuthSuccess, AuthError> {
        let retry = self.inner.retry;
        let deadline = retry.deadline.map(|d| started + d);
        let mut state = RetryState::new(&retry);
        let mut misses = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled {
                    attempts: state.attempts(),
                });
            }
            if let (Some(at), Some(limit)) = (deadline, retry.deadline) {
                if Instant::now() >= at {
                    return Err(AuthError::DeadlineExceeded {
                        attempts: state.attempts(),
                        deadline: limit,
                    });
                }
            }

            let Some(attempt) = state.begin_attempt() else {
                return Err(AuthError::Exhausted {
                    attempts: state.attempts(),
                });
            };

            let pass = self.scan_pass(req, cancel, attempt)?;
            totals.scans.merge(&pass.summary);
            totals.already_authenticated += pass.already_authenticated;
            self.record(|m| m.record_pass());

            match state.finish_attempt(pass.satisfied()) {
                Phase::Matched => {
                    return Ok(AuthSuccess {
                        attempts: attempt,
                        updated: totals.scans.updated,
                        already_authenticated: totals.already_authenticated,
                    });
                }
                Phase::Exhausted => {
                    return Err(AuthError::Exhausted { attempts: attempt });
                }
                Phase::Searching => {}
            }

            self.record(|m| m.record_error(MetricsErrorKind::NoMatch));
            let backoff = state.backoff();
            if misses.record_error(ErrorKey::NoMatch) {
                warn!(
                    "No conntrack entry to authenticate yet; sleeping: flow={}, attempt={}, tables={}, backoff_ms={}",
                    req,
                    attempt,
                    pass.tables,
                    backoff.as_millis()
                );
            } else {
                debug!(
                    "No conntrack entry to authenticate yet (repeated); sleeping: flow={}, attempt={}, backoff_ms={}",
                    req,
                    attempt,
                    backoff.as_millis()
                );
            }

            match sleep_or_cancel(cancel, backoff, deadline).await {
                Wake::Elapsed => state.advance_backoff(),
                Wake::Cancelled => {
                    return Err(AuthError::Cancelled {
                        attempts: state.attempts(),
                    });
                }
                Wake::Deadline => {
                    return Err(AuthError::DeadlineExceeded {
                        attempts: state.attempts(),
                        deadline: retry.deadline.unwrap_or_default(),
                    });
                }
            }
        }
    }

    /// Performs one pass over every table of the request's family.
    ///
    /// The table set is enumerated afresh on every pass.
    fn scan_pass(
        &self,
        req: &AuthRequest,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<Pass, AuthError> {
        let maps = enumerate(self.inner.maps.as_ref(), req.families());
        debug!(
            "Dumping conntrack maps: flow={}, attempt={}, count={}",
            req,
            attempt,
            maps.len()
        );

        let matcher = self.inner.matcher.as_ref();
        let mut pass = Pass {
            tables: maps.len(),
            ..Pass::default()
        };

        for map in &maps {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let mut already = 0;
            let summary = scan(map.as_ref(), |key, entry| {
                if matcher.matches(req, key, entry) {
                    return Some(EntryPatch::MARK_AUTH_OK);
                }
                if matcher.already_authenticated(req, key, entry) {
                    already += 1;
                }
                None
            })
            .map_err(|source| {
                error!(
                    "Error while scanning conntrack map; abandoning request: map={}, flow={}, attempt={}, error={}",
                    map.name(),
                    req,
                    attempt,
                    source
                );
                AuthError::Fatal { attempt, source }
            })?;

            for key in &summary.patched {
                self.record(|m| m.record_match(map.name(), key));
            }
            for _ in 0..summary.update_failures {
                self.record(|m| m.record_error(MetricsErrorKind::RecordUpdate));
            }

            pass.summary.merge(&summary);
            pass.already_authenticated += already;
        }

        Ok(pass)
    }

    fn report(
        &self,
        req: &AuthRequest,
        result: &Result<AuthSuccess, AuthError>,
        totals: &Totals,
        elapsed: Duration,
    ) {
        let (outcome, attempts, err) = match result {
            Ok(done) => {
                info!(
                    "Flow marked as authenticated: flow={}, attempts={}, updated={}, already_authenticated={}",
                    req,
                    done.attempts,
                    done.updated,
                    done.already_authenticated
                );
                (AuthEventOutcome::Authenticated, done.attempts, None)
            }
            Err(e) => {
                match e {
                    AuthError::Cancelled { .. } => {
                        debug!("Authentication request cancelled: flow={}, error={}", req, e);
                    }
                    AuthError::Fatal { .. } => {
                        error!("Authentication request failed: flow={}, error={}", req, e);
                    }
                    _ => {
                        warn!("Authentication request failed: flow={}, error={}", req, e);
                    }
                }
                self.record(|m| m.record_error(e.kind()));
                let attempts = match e {
                    AuthError::Fatal { attempt, .. } => *attempt,
                    other => other.attempts(),
                };
                (AuthEventOutcome::from_error(e), attempts, Some(e.to_string()))
            }
        };

        self.record(|m| {
            m.record_outcome(&AuthEvent {
                request: *req,
                outcome,
                attempts,
                updated: totals.scans.updated,
                already_authenticated: totals.already_authenticated,
                update_failures: totals.scans.update_failures,
                elapsed,
                error: err,
            });
        });
    }

    pub(super) fn record(&self, f: impl FnOnce(&dyn MetricsRecorder)) {
        if let Some(m) = self.inner.metrics.as_deref() {
            f(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctmap::memory::{Faults, InMemoryCtMap, InMemoryMapSet};
    use crate::ctmap::{CtEntry, CtFlags, CtKey, FlowTuple, MapKind, TupleFlags, IPPROTO_TCP};
    use std::sync::Mutex;

    fn flow(src: &str, dst: &str, sport: u16) -> FlowTuple {
        FlowTuple {
            source_addr: src.parse().unwrap(),
            dest_addr: dst.parse().unwrap(),
            source_port: sport,
            dest_port: 443,
            protocol: IPPROTO_TCP,
        }
    }

    fn key(flow: &FlowTuple) -> CtKey {
        CtKey::from_tuple(flow, TupleFlags::OUT).unwrap()
    }

    fn pending() -> CtEntry {
        CtEntry {
            tx_packets: 4,
            tx_bytes: 312,
            lifetime: 21600,
            flags: CtFlags::AUTH_REQUIRED | CtFlags::SEEN_NON_SYN,
            src_sec_id: 1234,
            ..CtEntry::default()
        }
    }

    fn setup() -> (Arc<InMemoryMapSet>, Arc<InMemoryCtMap>) {
        let maps = Arc::new(InMemoryMapSet::with_global_maps());
        let tcp4 = maps.global(MapKind::IPV4_TCP).unwrap();
        (maps, tcp4)
    }

    fn fast(maps: Arc<InMemoryMapSet>, attempts: u32) -> CtMapAuthenticator {
        CtMapAuthenticator::builder(maps)
            .max_attempts(attempts)
            .retry_interval(Duration::from_secs(1))
            .build()
    }

    #[derive(Default)]
    struct Recorder {
        passes: Mutex<u32>,
        matches: Mutex<Vec<String>>,
        errors: Mutex<Vec<MetricsErrorKind>>,
        events: Mutex<Vec<AuthEvent>>,
    }

    impl MetricsRecorder for Recorder {
        fn record_pass(&self) {
            *self.passes.lock().unwrap() += 1;
        }

        fn record_match(&self, map: &str, _key: &CtKey) {
            self.matches.lock().unwrap().push(map.to_owned());
        }

        fn record_outcome(&self, event: &AuthEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn record_error(&self, kind: MetricsErrorKind) {
            self.errors.lock().unwrap().push(kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn marks_only_the_requested_flow() {
        let (maps, tcp4) = setup();
        let wanted = flow("10.0.0.1", "10.0.0.2", 40000);
        let other = flow("10.0.0.3", "10.0.0.2", 40001);
        tcp4.insert(key(&wanted), pending());
        tcp4.insert(key(&other), pending());

        let done = fast(maps, 3)
            .mark_authenticated(&AuthRequest::new(wanted).unwrap())
            .await
            .unwrap();

        assert_eq!(
            done,
            AuthSuccess {
                attempts: 1,
                updated: 1,
                already_authenticated: 0
            }
        );
        assert!(tcp4.get(&key(&wanted)).unwrap().is_authenticated());
        assert_eq!(tcp4.get(&key(&other)).unwrap(), pending());
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_every_other_field() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());

        fast(maps, 1)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();

        let mut expected = pending();
        expected.flags |= CtFlags::AUTH_OK;
        assert_eq!(tcp4.get(&key(&f)).unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_exactly_max_attempts_passes() {
        let (maps, tcp4) = setup();
        let tcp6 = maps.global(MapKind::IPV6_TCP).unwrap();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        let started = Instant::now();

        let err = fast(maps, 3)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Exhausted { attempts: 3 }));
        assert_eq!(tcp4.stats().dumps, 3);
        assert_eq!(tcp4.stats().closes, 3);
        assert_eq!(tcp6.stats().dumps, 0);
        // Two sleeps between three passes, none after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn finds_record_created_after_the_request() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert_after_dumps(2, key(&f), pending());

        let done = fast(maps, 10)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();

        assert_eq!(done.attempts, 3);
        assert!(tcp4.get(&key(&f)).unwrap().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_request_succeeds_without_writing() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());
        let authenticator = fast(maps, 3);
        let req = AuthRequest::new(f).unwrap();

        authenticator.mark_authenticated(&req).await.unwrap();
        let writes = tcp4.stats().updates;
        let again = authenticator.mark_authenticated(&req).await.unwrap();

        assert_eq!(again.attempts, 1);
        assert_eq!(again.updated, 0);
        assert_eq!(again.already_authenticated, 1);
        assert_eq!(tcp4.stats().updates, writes);
    }

    #[tokio::test(start_paused = true)]
    async fn searches_ipv6_tables_for_ipv6_flows() {
        let (maps, tcp4) = setup();
        let any6 = maps.global(MapKind::IPV6_ANY).unwrap();
        let mut f = flow("fd00::1", "fd00::2", 5353);
        f.protocol = crate::ctmap::IPPROTO_UDP;
        any6.insert(key(&f), pending());

        let done = fast(maps, 2)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();

        assert_eq!(done.updated, 1);
        assert!(any6.get(&key(&f)).unwrap().is_authenticated());
        assert_eq!(tcp4.stats().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_tables_count_as_empty() {
        let (maps, tcp4) = setup();
        tcp4.set_present(false);
        let any4 = maps.global(MapKind::IPV4_ANY).unwrap();
        let mut f = flow("10.0.0.1", "10.0.0.2", 40000);
        f.protocol = crate::ctmap::IPPROTO_UDP;
        any4.insert(key(&f), pending());

        let done = fast(maps, 1)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();
        assert_eq!(done.updated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dump_failure_is_fatal_and_closes_the_table() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());
        tcp4.set_faults(Faults {
            dump_after: Some(0),
            ..Faults::default()
        });

        let err = fast(maps, 5)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Fatal { attempt: 1, .. }));
        assert_eq!(err.attempts(), 0);
        assert_eq!(tcp4.stats().opens, tcp4.stats().closes);
        assert_eq!(tcp4.stats().dumps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_are_retried() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());
        tcp4.set_faults(Faults {
            update: true,
            ..Faults::default()
        });
        let recorder = Arc::new(Recorder::default());
        let authenticator = CtMapAuthenticator::builder(maps)
            .max_attempts(2)
            .metrics(recorder.clone())
            .build();

        let err = authenticator
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Exhausted { attempts: 2 }));
        assert!(tcp4.get(&key(&f)).unwrap().needs_auth());
        let errors = recorder.errors.lock().unwrap();
        assert_eq!(
            errors
                .iter()
                .filter(|k| **k == MetricsErrorKind::RecordUpdate)
                .count(),
            2
        );
        assert_eq!(errors.last(), Some(&MetricsErrorKind::Exhausted));
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuthEventOutcome::Exhausted);
        assert_eq!(events[0].update_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_passes_matches_and_outcome() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert_after_dumps(1, key(&f), pending());
        let recorder = Arc::new(Recorder::default());
        let authenticator = CtMapAuthenticator::builder(maps)
            .metrics(recorder.clone())
            .build();

        authenticator
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();

        assert_eq!(*recorder.passes.lock().unwrap(), 2);
        assert_eq!(
            *recorder.matches.lock().unwrap(),
            vec!["cilium_ct4_global".to_owned()]
        );
        assert_eq!(
            *recorder.errors.lock().unwrap(),
            vec![MetricsErrorKind::NoMatch]
        );
        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0].outcome, AuthEventOutcome::Authenticated);
        assert_eq!(events[0].attempts, 2);
        assert_eq!(events[0].updated, 1);
        assert_eq!(events[0].error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_sleep() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        let authenticator = CtMapAuthenticator::builder(maps)
            .retry_interval(Duration::from_secs(60))
            .build();
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = authenticator
            .mark_authenticated_with_cancel(&AuthRequest::new(f).unwrap(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(tcp4.stats().dumps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_scans_nothing() {
        let (maps, tcp4) = setup();
        let token = CancellationToken::new();
        token.cancel();

        let err = fast(maps, 3)
            .mark_authenticated_with_cancel(
                &AuthRequest::new(flow("10.0.0.1", "10.0.0.2", 1)).unwrap(),
                &token,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Cancelled { attempts: 0 }));
        assert_eq!(tcp4.stats().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_request() {
        let (maps, _) = setup();
        let authenticator = CtMapAuthenticator::builder(maps)
            .max_attempts(100)
            .retry_interval(Duration::from_secs(1))
            .deadline(Some(Duration::from_millis(2500)))
            .build();

        let started = Instant::now();
        let err = authenticator
            .mark_authenticated(&AuthRequest::new(flow("10.0.0.1", "10.0.0.2", 1)).unwrap())
            .await
            .unwrap_err();

        match err {
            AuthError::DeadlineExceeded { attempts, deadline } => {
                assert_eq!(attempts, 3);
                assert_eq!(deadline, Duration::from_millis(2500));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(started.elapsed() <= Duration::from_millis(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_matcher_is_used() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());
        let authenticator = CtMapAuthenticator::builder(maps)
            .max_attempts(1)
            .matcher(|_: &AuthRequest, _: &CtKey, _: &CtEntry| false)
            .build();

        let err = authenticator
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Exhausted { attempts: 1 }));
        assert!(tcp4.get(&key(&f)).unwrap().needs_auth());
    }

    #[tokio::test(start_paused = true)]
    async fn record_losing_auth_required_before_the_write_is_not_marked() {
        let (maps, tcp4) = setup();
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        tcp4.insert(key(&f), pending());
        let replacement = CtEntry {
            flags: CtFlags::SEEN_NON_SYN,
            ..CtEntry::default()
        };
        let table = Arc::clone(&tcp4);
        let authenticator = CtMapAuthenticator::builder(maps)
            .max_attempts(2)
            .matcher(move |_: &AuthRequest, key: &CtKey, entry: &CtEntry| {
                if !entry.needs_auth() {
                    return false;
                }
                // The dataplane recycles the slot between the dump and the write.
                table.insert(*key, replacement);
                true
            })
            .build();

        let err = authenticator
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Exhausted { attempts: 2 }));
        assert_eq!(tcp4.get(&key(&f)).unwrap(), replacement);
        assert_eq!(tcp4.stats().updates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finds_table_that_appears_between_passes() {
        let maps = Arc::new(InMemoryMapSet::new());
        let f = flow("10.0.0.1", "10.0.0.2", 40000);
        let tcp4 = Arc::new(InMemoryCtMap::global(MapKind::IPV4_TCP));
        tcp4.insert(key(&f), pending());

        let later = Arc::clone(&maps);
        let table = Arc::clone(&tcp4);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            later.add(table);
        });

        let done = fast(maps, 3)
            .mark_authenticated(&AuthRequest::new(f).unwrap())
            .await
            .unwrap();

        assert_eq!(done.attempts, 2);
        assert_eq!(done.updated, 1);
        assert!(tcp4.get(&key(&f)).unwrap().is_authenticated());
    }
}
