//! `AuthManager` lifecycle: dispatch, dedup, cancellation and shutdown.

use conntrack_auth::auth::{
    AuthError, AuthEvent, AuthEventOutcome, AuthManager, AuthRequest, CtMapAuthenticator,
    ManagerError, MetricsErrorKind, MetricsRecorder, SubmitError,
};
use conntrack_auth::ctmap::memory::InMemoryMapSet;
use conntrack_auth::ctmap::{CtEntry, CtFlags, CtKey, FlowTuple, MapKind, TupleFlags, IPPROTO_UDP};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn flow(sport: u16) -> FlowTuple {
    FlowTuple {
        source_addr: "fd00:10::4".parse().unwrap(),
        dest_addr: "fd00:20::9".parse().unwrap(),
        source_port: sport,
        dest_port: 53,
        protocol: IPPROTO_UDP,
    }
}

#[derive(Default)]
struct Events {
    outcomes: Mutex<Vec<AuthEvent>>,
    errors: Mutex<Vec<MetricsErrorKind>>,
}

impl MetricsRecorder for Events {
    fn record_outcome(&self, event: &AuthEvent) {
        self.outcomes.lock().unwrap().push(event.clone());
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        self.errors.lock().unwrap().push(kind);
    }
}

#[tokio::test(start_paused = true)]
async fn processes_requests_in_background() {
    let maps = Arc::new(InMemoryMapSet::with_global_maps());
    let table = maps.global(MapKind::IPV6_ANY).unwrap();
    let events = Arc::new(Events::default());
    let manager = AuthManager::new(
        CtMapAuthenticator::builder(maps)
            .metrics(events.clone())
            .build(),
    );

    let flows: Vec<_> = (1..=3).map(flow).collect();
    let mut tickets = Vec::new();
    for (i, f) in flows.iter().enumerate() {
        let key = CtKey::from_tuple(f, TupleFlags::OUT).unwrap();
        let entry = CtEntry {
            flags: CtFlags::AUTH_REQUIRED,
            ..CtEntry::default()
        };
        table.insert_after_dumps(i, key, entry);
        tickets.push(manager.submit(AuthRequest::new(*f).unwrap()).unwrap());
    }
    assert_eq!(manager.pending().len(), 3);

    for ticket in tickets {
        let done = ticket.outcome().await.unwrap().unwrap();
        assert_eq!(done.updated, 1);
    }
    assert!(manager.pending().is_empty());

    let outcomes = events.outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|e| e.outcome == AuthEventOutcome::Authenticated));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_is_rejected_until_done() {
    let maps = Arc::new(InMemoryMapSet::with_global_maps());
    let manager = AuthManager::new(
        CtMapAuthenticator::builder(maps)
            .max_attempts(2)
            .build(),
    );
    let f = flow(5);

    let first = manager.submit(AuthRequest::new(f).unwrap()).unwrap();
    assert_eq!(
        manager.submit(AuthRequest::new(f).unwrap()).unwrap_err(),
        SubmitError::AlreadyPending(f)
    );

    let outcome = first.outcome().await.unwrap();
    assert!(matches!(outcome, Err(AuthError::Exhausted { attempts: 2 })));
    assert!(manager.submit(AuthRequest::new(f).unwrap()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_sleeping_workers() {
    let maps = Arc::new(InMemoryMapSet::with_global_maps());
    let events = Arc::new(Events::default());
    let manager = AuthManager::new(
        CtMapAuthenticator::builder(maps)
            .retry_interval(Duration::from_secs(30))
            .metrics(events.clone())
            .build(),
    );
    let tickets: Vec<_> = (1..=4)
        .map(|p| manager.submit(AuthRequest::new(flow(p)).unwrap()).unwrap())
        .collect();

    // Let every worker finish its first pass and go to sleep.
    tokio::time::sleep(Duration::from_millis(1)).await;
    manager
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    for ticket in tickets {
        assert!(matches!(
            ticket.outcome().await.unwrap(),
            Err(AuthError::Cancelled { attempts: 1 })
        ));
    }
    assert_eq!(
        events
            .errors
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == MetricsErrorKind::Cancelled)
            .count(),
        4
    );
    assert_eq!(
        manager.submit(AuthRequest::new(flow(9)).unwrap()).unwrap_err(),
        SubmitError::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_manager_cancels_workers() {
    let maps = Arc::new(InMemoryMapSet::with_global_maps());
    let manager = AuthManager::new(
        CtMapAuthenticator::builder(maps)
            .retry_interval(Duration::from_secs(30))
            .build(),
    );
    let ticket = manager.submit(AuthRequest::new(flow(1)).unwrap()).unwrap();
    drop(manager);

    let outcome = ticket.outcome().await;
    assert!(matches!(outcome, Ok(Err(AuthError::Cancelled { .. }))));
}

#[test]
fn lost_worker_error_is_descriptive() {
    assert_eq!(
        ManagerError::WorkerLost.to_string(),
        "worker ended without an outcome"
    );
}
