use super::authenticator::{AuthSuccess, CtMapAuthenticator};
use super::errors::{AuthError, ManagerError, MetricsErrorKind, SubmitError};
use super::request::AuthRequest;
use crate::ctmap::FlowTuple;
use crate::prelude::{debug, warn};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Dispatches authentication requests to background workers.
///
/// Each accepted request runs on its own tokio task driving
/// [`CtMapAuthenticator::mark_authenticated_with_cancel`]. At most one request per flow is
/// in flight; a second submission for the same flow is rejected until the first finishes.
///
/// Dropping the manager cancels all in-flight requests without waiting for them.
///
/// # Example
///
/// ```rust
/// use conntrack_auth::auth::{AuthError, AuthManager, AuthRequest, CtMapAuthenticator};
/// use conntrack_auth::ctmap::memory::InMemoryMapSet;
/// use conntrack_auth::ctmap::{FlowTuple, IPPROTO_TCP};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let authenticator = CtMapAuthenticator::builder(Arc::new(InMemoryMapSet::with_global_maps()))
///     .max_attempts(1)
///     .build();
/// let manager = AuthManager::new(authenticator);
///
/// let flow = FlowTuple {
///     source_addr: "10.0.0.1".parse()?,
///     dest_addr: "10.0.0.2".parse()?,
///     source_port: 41000,
///     dest_port: 443,
///     protocol: IPPROTO_TCP,
/// };
/// let ticket = manager.submit(AuthRequest::new(flow)?)?;
///
/// // No table holds the flow, so the single pass finds nothing.
/// let outcome = ticket.outcome().await?;
/// assert!(matches!(outcome, Err(AuthError::Exhausted { attempts: 1 })));
///
/// manager.shutdown_with_timeout(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct AuthManager {
    inner: Arc<Inner>,
}

struct Inner {
    authenticator: CtMapAuthenticator,
    cancel: CancellationToken,
    next_id: AtomicU64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    pending: HashMap<FlowTuple, Worker>,
}

struct Worker {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle to the outcome of a submitted request.
#[derive(Debug)]
pub struct AuthTicket {
    flow: FlowTuple,
    rx: oneshot::Receiver<Result<AuthSuccess, AuthError>>,
}

impl AuthTicket {
    /// The flow the request was submitted for.
    pub const fn flow(&self) -> &FlowTuple {
        &self.flow
    }

    /// Waits for the worker to finish and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::WorkerLost`] if the worker ended without reporting a
    /// result, which happens when it panicked or was aborted during shutdown.
    pub async fn outcome(self) -> Result<Result<AuthSuccess, AuthError>, ManagerError> {
        self.rx.await.map_err(|_| ManagerError::WorkerLost)
    }
}

/// Removes a worker's pending entry when the worker ends, however it ends.
struct PendingGuard {
    inner: Arc<Inner>,
    flow: FlowTuple,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.pending.get(&self.flow).is_some_and(|w| w.id == self.id) {
            state.pending.remove(&self.flow);
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_join_error(&self, err: &tokio::task::JoinError) {
        warn!("Error joining auth worker during shutdown: error={}", err);
        self.authenticator
            .record(|m| m.record_error(MetricsErrorKind::WorkerJoinFailed));
    }
}

impl Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("AuthManager")
            .field("authenticator", &self.inner.authenticator)
            .field("closed", &state.closed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl AuthManager {
    /// Creates a manager running requests with `authenticator`.
    ///
    /// No task is spawned until a request is submitted.
    pub fn new(authenticator: CtMapAuthenticator) -> Self {
        Self {
            inner: Arc::new(Inner {
                authenticator,
                cancel: CancellationToken::new(),
                next_id: AtomicU64::new(0),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Starts processing `req` on a background task.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::AlreadyPending`] if a request for the same flow is in flight.
    /// - [`SubmitError::Closed`] if the manager has been shut down.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn submit(&self, req: AuthRequest) -> Result<AuthTicket, SubmitError> {
        let flow = *req.flow();
        let mut state = self.inner.state();
        if state.closed {
            return Err(SubmitError::Closed);
        }
        if state.pending.contains_key(&flow) {
            debug!("Authentication already in flight; rejecting: flow={}", flow);
            return Err(SubmitError::AlreadyPending(flow));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let (tx, rx) = oneshot::channel();

        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            flow,
            id,
        };
        let token = cancel.clone();
        // The worker cannot remove its entry before it is inserted: the state lock is
        // held until then.
        let handle = tokio::spawn(async move {
            let result = guard
                .inner
                .authenticator
                .mark_authenticated_with_cancel(&req, &token)
                .await;
            drop(guard);
            // The ticket may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });

        state.pending.insert(flow, Worker { id, cancel, handle });
        debug!(
            "Authentication request accepted: flow={}, in_flight={}",
            flow,
            state.pending.len()
        );
        Ok(AuthTicket { flow, rx })
    }

    /// Flows with a request in flight, in no particular order.
    pub fn pending(&self) -> Vec<FlowTuple> {
        self.inner.state().pending.keys().copied().collect()
    }

    /// Cancels the in-flight request for `flow`.
    ///
    /// Returns `false` if no request for `flow` is in flight. The ticket of a cancelled
    /// request resolves to [`AuthError::Cancelled`].
    pub fn cancel(&self, flow: &FlowTuple) -> bool {
        match self.inner.state().pending.get(flow) {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns `true` once shutdown has started.
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    fn close(&self) -> Option<Vec<JoinHandle<()>>> {
        let mut state = self.inner.state();
        if state.closed {
            return None;
        }
        state.closed = true;
        self.inner.cancel.cancel();
        Some(state.pending.drain().map(|(_, w)| w.handle).collect())
    }

    /// Cancels every in-flight request and waits for the workers to finish.
    ///
    /// This method is idempotent; later calls return immediately.
    ///
    /// **Note:** Workers only stop at their next cancellation point (between tables
    /// or while sleeping). Prefer [`AuthManager::shutdown_with_timeout`] when a bound
    /// is needed.
    pub async fn shutdown(&self) {
        let Some(handles) = self.close() else {
            return;
        };
        for handle in handles {
            if let Err(e) = handle.await {
                self.inner.record_join_error(&e);
            }
        }
    }

    /// Cancels every in-flight request and waits up to `timeout` for the workers.
    ///
    /// Workers still running when the timeout expires are aborted; their tickets
    /// resolve to [`ManagerError::WorkerLost`].
    ///
    /// This method is idempotent; later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::ShutdownTimeout`] if the workers had to be aborted.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), ManagerError> {
        let Some(mut handles) = self.close() else {
            return Ok(());
        };

        let mut joined = 0;
        let waited = tokio::time::timeout(timeout, async {
            for handle in &mut handles {
                if let Err(e) = handle.await {
                    self.inner.record_join_error(&e);
                }
                joined += 1;
            }
        })
        .await;

        if waited.is_ok() {
            return Ok(());
        }

        warn!(
            "Shutdown timeout exceeded; aborting auth workers: remaining={}",
            handles.len() - joined
        );
        let remaining = handles.split_off(joined);
        for handle in &remaining {
            handle.abort();
        }
        for handle in remaining {
            // Wait for the abort to take effect.
            let _ = handle.await;
        }
        Err(ManagerError::ShutdownTimeout)
    }
}

impl Drop for AuthManager {
    fn drop(&mut self) {
        // Best-effort cancellation. Do not block in Drop.
        self.inner.cancel.cancel();
    }
}
