//! In-process connection-tracking tables.
//!
//! [`InMemoryCtMap`] behaves like a pinned kernel table as far as this crate is
//! concerned: it can disappear, its dump visits a snapshot of keys while values are
//! read live, and single-record writes are atomic. Faults can be injected to exercise
//! the error paths of the scanner and the authenticator.

use super::entry::CtEntry;
use super::error::CtMapError;
use super::key::CtKey;
use super::kind::{MapKind, GLOBAL_SUFFIX};
use super::maps::{CtMap, MapSet, OpenCtMap};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Faults injected into an [`InMemoryCtMap`].
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// `open` fails with an I/O error of this kind.
    ///
    /// `NotFound` is reported as [`CtMapError::NotPresent`].
    pub open: Option<io::ErrorKind>,
    /// The dump fails after this many keys have been walked (or at the end of the
    /// table if it holds fewer).
    pub dump_after: Option<usize>,
    /// Every `update` fails.
    pub update: bool,
}

/// Operation counters of an [`InMemoryCtMap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Successful opens.
    pub opens: usize,
    /// Closes of opened handles.
    pub closes: usize,
    /// Dumps started.
    pub dumps: usize,
    /// Successful writes.
    pub updates: usize,
}

#[derive(Debug, Default)]
struct State {
    present: bool,
    entries: BTreeMap<CtKey, CtEntry>,
    scheduled: Vec<(usize, CtKey, CtEntry)>,
    faults: Faults,
    stats: MapStats,
}

/// A connection-tracking table held in memory.
#[derive(Debug)]
pub struct InMemoryCtMap {
    name: String,
    kind: MapKind,
    state: Mutex<State>,
}

impl InMemoryCtMap {
    /// Creates an empty table of `kind` for `scope` (`global` or an endpoint id).
    pub fn new(kind: MapKind, scope: &str) -> Self {
        Self {
            name: kind.map_name(scope),
            kind,
            state: Mutex::new(State {
                present: true,
                ..State::default()
            }),
        }
    }

    /// Creates an empty node-wide table of `kind`.
    pub fn global(kind: MapKind) -> Self {
        Self::new(kind, GLOBAL_SUFFIX)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a record, as the dataplane does on packet processing.
    pub fn insert(&self, key: CtKey, entry: CtEntry) {
        self.state().entries.insert(key, entry);
    }

    /// Inserts a record once `dumps` dumps have been started, just before the next
    /// dump begins.
    ///
    /// Models a flow whose first packet reaches the dataplane after authentication
    /// has already completed.
    pub fn insert_after_dumps(&self, dumps: usize, key: CtKey, entry: CtEntry) {
        self.state().scheduled.push((dumps, key, entry));
    }

    /// Removes a record, as garbage collection does on expiry.
    pub fn remove(&self, key: &CtKey) -> Option<CtEntry> {
        self.state().entries.remove(key)
    }

    /// Returns the current value of a record.
    pub fn get(&self, key: &CtKey) -> Option<CtEntry> {
        self.state().entries.get(key).copied()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Returns `true` if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the table as existing or not (e.g. the pinned object was deleted).
    pub fn set_present(&self, present: bool) {
        self.state().present = present;
    }

    /// Replaces the injected faults.
    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    /// Returns the operation counters.
    pub fn stats(&self) -> MapStats {
        self.state().stats
    }
}

impl CtMap for InMemoryCtMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MapKind {
        self.kind
    }

    fn open(&self) -> Result<Box<dyn OpenCtMap + '_>, CtMapError> {
        let mut state = self.state();
        if !state.present {
            return Err(CtMapError::NotPresent {
                map: self.name.clone(),
            });
        }
        if let Some(kind) = state.faults.open {
            return Err(CtMapError::from_open_error(self.name.clone(), kind.into()));
        }
        state.stats.opens += 1;
        Ok(Box::new(Handle {
            map: self,
            closed: false,
        }))
    }
}

struct Handle<'a> {
    map: &'a InMemoryCtMap,
    closed: bool,
}

impl Handle<'_> {
    fn dump_failure(&self) -> CtMapError {
        CtMapError::Io {
            map: self.map.name.clone(),
            source: io::Error::other("injected dump failure"),
        }
    }
}

impl OpenCtMap for Handle<'_> {
    fn dump_with_callback(
        &self,
        visit: &mut dyn FnMut(&CtKey, &CtEntry),
    ) -> Result<(), CtMapError> {
        let (keys, fail_after) = {
            let mut state = self.map.state();
            let started = state.stats.dumps;
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
                .into_iter()
                .partition(|(after, _, _)| *after <= started);
            state.scheduled = later;
            for (_, key, entry) in due {
                state.entries.insert(key, entry);
            }
            state.stats.dumps += 1;
            let keys: Vec<CtKey> = state.entries.keys().copied().collect();
            (keys, state.faults.dump_after)
        };

        for (idx, key) in keys.iter().enumerate() {
            if fail_after == Some(idx) {
                return Err(self.dump_failure());
            }
            // Values are read live; records removed since the snapshot are skipped.
            let Some(entry) = self.map.get(key) else {
                continue;
            };
            visit(key, &entry);
        }

        if fail_after.is_some() {
            return Err(self.dump_failure());
        }
        Ok(())
    }

    fn lookup(&self, key: &CtKey) -> Result<Option<CtEntry>, CtMapError> {
        Ok(self.map.get(key))
    }

    fn update(&self, key: &CtKey, value: &CtEntry) -> Result<(), CtMapError> {
        let mut state = self.map.state();
        if state.faults.update {
            return Err(CtMapError::Update {
                map: self.map.name.clone(),
                reason: "injected update failure".to_owned(),
            });
        }
        state.entries.insert(*key, *value);
        state.stats.updates += 1;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.map.state().stats.closes += 1;
        }
    }
}

/// A mutable set of [`InMemoryCtMap`] tables.
#[derive(Debug, Default)]
pub struct InMemoryMapSet {
    maps: RwLock<Vec<Arc<InMemoryCtMap>>>,
}

impl InMemoryMapSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding the four node-wide tables.
    pub fn with_global_maps() -> Self {
        let set = Self::new();
        for kind in MapKind::ALL {
            set.add(Arc::new(InMemoryCtMap::global(kind)));
        }
        set
    }

    /// Adds a table, replacing any table with the same name.
    pub fn add(&self, map: Arc<InMemoryCtMap>) {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        maps.retain(|m| m.name() != map.name());
        maps.push(map);
    }

    /// Removes a table by name.
    pub fn remove(&self, name: &str) -> Option<Arc<InMemoryCtMap>> {
        let mut maps = self.maps.write().unwrap_or_else(PoisonError::into_inner);
        let idx = maps.iter().position(|m| m.name() == name)?;
        Some(maps.remove(idx))
    }

    /// Returns a table by name.
    pub fn get(&self, name: &str) -> Option<Arc<InMemoryCtMap>> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Returns the node-wide table of `kind`, if registered.
    pub fn global(&self, kind: MapKind) -> Option<Arc<InMemoryCtMap>> {
        self.get(&kind.global_name())
    }
}

impl MapSet for InMemoryMapSet {
    fn maps(&self) -> Vec<Arc<dyn CtMap>> {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn CtMap>)
            .collect()
    }
}
