//! Deciding which conntrack records an authentication request refers to.

use super::request::AuthRequest;
use crate::ctmap::{CtEntry, CtFlags, CtKey};
use std::sync::Arc;

/// Predicate selecting the records to mark for a request.
///
/// Implementations must be specific to the requested flow: a record is only ever
/// selected because its key identifies the flow named by the request, never merely
/// because it requires authentication. Concurrent unrelated flows can require
/// authentication at the same time, and marking them would admit unauthenticated
/// traffic.
pub trait Matcher: Send + Sync + 'static {
    /// Returns `true` if `entry` under `key` belongs to the flow of `req` and still
    /// needs to be marked (`AUTH_REQUIRED` set, `AUTH_OK` clear).
    fn matches(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool;

    /// Returns `true` if `entry` under `key` belongs to the flow of `req` and is already
    /// marked.
    ///
    /// Used to report a repeated request as satisfied without writing anything.
    fn already_authenticated(&self, _req: &AuthRequest, _key: &CtKey, _entry: &CtEntry) -> bool {
        false
    }
}

impl<F> Matcher for F
where
    F: Fn(&AuthRequest, &CtKey, &CtEntry) -> bool + Send + Sync + 'static,
{
    fn matches(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        self(req, key, entry)
    }
}

impl Matcher for Arc<dyn Matcher> {
    fn matches(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        (**self).matches(req, key, entry)
    }

    fn already_authenticated(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        (**self).already_authenticated(req, key, entry)
    }
}

/// Matches records by full flow identity.
///
/// A record identifies the flow when its key carries the request's 5-tuple (address
/// family included), and, if the request names them, the same direction and source
/// security identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMatcher;

impl FlowMatcher {
    /// Returns `true` if `key`/`entry` belong to the flow named by `req`.
    pub fn identifies(req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        if key.family() != req.family() || key.tuple() != *req.flow() {
            return false;
        }
        if req.direction().is_some_and(|dir| dir != key.tuple_flags()) {
            return false;
        }
        if req
            .source_identity()
            .is_some_and(|id| id != entry.src_sec_id)
        {
            return false;
        }
        true
    }
}

impl Matcher for FlowMatcher {
    fn matches(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        entry.needs_auth() && Self::identifies(req, key, entry)
    }

    fn already_authenticated(&self, req: &AuthRequest, key: &CtKey, entry: &CtEntry) -> bool {
        entry
            .flags
            .contains(CtFlags::AUTH_REQUIRED | CtFlags::AUTH_OK)
            && Self::identifies(req, key, entry)
    }
}
