//! Streaming scan of a single table with in-place patching of visited records.

use super::entry::{CtEntry, EntryPatch};
use super::error::CtMapError;
use super::key::CtKey;
use super::maps::{CtMap, OpenCtMap};
use crate::backoff::{ErrorKey, ErrorTracker, MAX_CONSECUTIVE_SAME_ERROR};
use crate::prelude::{debug, info, warn};
use std::fmt;
use std::ops::Deref;

/// Scoped handle to an opened table.
///
/// [`OpenCtMap::close`] runs exactly once when the guard is dropped, whichever way the
/// scan ends (success, error, early return or unwinding).
pub struct MapGuard<'a> {
    name: &'a str,
    inner: Box<dyn OpenCtMap + 'a>,
}

impl<'a> MapGuard<'a> {
    /// Opens `map`.
    ///
    /// Returns `Ok(None)` if the table does not exist.
    ///
    /// # Errors
    ///
    /// Returns any open failure other than [`CtMapError::NotPresent`].
    pub fn open(map: &'a dyn CtMap) -> Result<Option<Self>, CtMapError> {
        match map.open() {
            Ok(inner) => Ok(Some(Self {
                name: map.name(),
                inner,
            })),
            Err(e) if e.is_not_present() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Name of the opened table.
    pub fn name(&self) -> &str {
        self.name
    }
}

impl<'a> Deref for MapGuard<'a> {
    type Target = dyn OpenCtMap + 'a;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for MapGuard<'_> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for MapGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapGuard").field("name", &self.name).finish()
    }
}

/// Counters describing one table scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Whether the table existed.
    pub present: bool,
    /// Records visited.
    pub visited: usize,
    /// Records for which the visitor returned a patch.
    pub matched: usize,
    /// Matched records written back.
    pub updated: usize,
    /// Keys of the records written back.
    pub patched: Vec<CtKey>,
    /// Matched records whose current value already carried the patch (no write).
    pub unchanged: usize,
    /// Matched records that were removed before they could be patched.
    pub vanished: usize,
    /// Matched records whose current value no longer carries the bits the patch
    /// requires (no write).
    pub stale: usize,
    /// Matched records whose write failed.
    pub update_failures: usize,
}

impl ScanSummary {
    /// Adds the counters of `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.present |= other.present;
        self.visited += other.visited;
        self.matched += other.matched;
        self.updated += other.updated;
        self.patched.extend_from_slice(&other.patched);
        self.unchanged += other.unchanged;
        self.vanished += other.vanished;
        self.stale += other.stale;
        self.update_failures += other.update_failures;
    }
}

/// Streams every record of `map` through `visit`, patching the ones it selects.
///
/// When `visit` returns a patch, the record is re-read and the patch is applied to its
/// current value before the write, so dataplane changes made since the dump started
/// are preserved. No write is issued when the patch is already present, or when the
/// current value no longer carries the bits the patch requires. The dump then carries
/// on with the next record.
///
/// A table that does not exist yields an empty summary. A failed write is logged and
/// counted; it does not stop the scan.
///
/// # Errors
///
/// Returns an error if the table exists but cannot be opened or dumped, or if it yields
/// a key of the wrong address family. Partial progress is discarded by the caller.
pub fn scan<F>(map: &dyn CtMap, mut visit: F) -> Result<ScanSummary, CtMapError>
where
    F: FnMut(&CtKey, &CtEntry) -> Option<EntryPatch>,
{
    let Some(guard) = MapGuard::open(map)? else {
        debug!("Conntrack map not present; skipping: map={}", map.name());
        return Ok(ScanSummary::default());
    };

    let family = map.kind().family;
    let mut summary = ScanSummary {
        present: true,
        ..ScanSummary::default()
    };
    let mut defect: Option<CtMapError> = None;
    let mut update_errors = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

    guard.dump_with_callback(&mut |key, entry| {
        if defect.is_some() {
            return;
        }
        summary.visited += 1;

        if key.family() != family {
            defect = Some(CtMapError::FamilyMismatch {
                map: guard.name().to_owned(),
                expected: family,
                actual: key.family(),
            });
            return;
        }

        let Some(patch) = visit(key, entry) else {
            return;
        };
        summary.matched += 1;

        match apply_patch(&guard, key, patch) {
            Ok(Patched::Written) => {
                summary.updated += 1;
                summary.patched.push(*key);
                update_errors.reset();
                info!(
                    "Patched conntrack entry: map={}, key={}, set={}",
                    guard.name(),
                    key,
                    patch.flags()
                );
            }
            Ok(Patched::Unchanged) => summary.unchanged += 1,
            Ok(Patched::Stale) => {
                summary.stale += 1;
                debug!(
                    "Conntrack entry changed before patching; skipping: map={}, key={}, required={}",
                    guard.name(),
                    key,
                    patch.required()
                );
            }
            Ok(Patched::Vanished) => {
                summary.vanished += 1;
                debug!(
                    "Conntrack entry removed before patching: map={}, key={}",
                    guard.name(),
                    key
                );
            }
            Err(e) => {
                summary.update_failures += 1;
                if update_errors.record_error(ErrorKey::RecordUpdate) {
                    warn!("Failed to update conntrack entry: key={}, error={}", key, e);
                } else {
                    debug!(
                        "Failed to update conntrack entry (repeated): key={}, error={}, consecutive_failures={}",
                        key,
                        e,
                        update_errors.consecutive_count()
                    );
                }
            }
        }
    })?;

    if let Some(e) = defect {
        return Err(e);
    }

    debug!(
        "Scanned conntrack map: map={}, visited={}, matched={}, updated={}",
        guard.name(),
        summary.visited,
        summary.matched,
        summary.updated
    );
    Ok(summary)
}

enum Patched {
    Written,
    Unchanged,
    Stale,
    Vanished,
}

fn apply_patch(map: &MapGuard<'_>, key: &CtKey, patch: EntryPatch) -> Result<Patched, CtMapError> {
    let Some(current) = map.lookup(key)? else {
        return Ok(Patched::Vanished);
    };
    if !patch.applies_to(&current) {
        return Ok(Patched::Stale);
    }
    let Some(next) = patch.apply(&current) else {
        return Ok(Patched::Unchanged);
    };
    map.update(key, &next)?;
    Ok(Patched::Written)
}
