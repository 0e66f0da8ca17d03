//! Table handles and table-set enumeration.

use super::entry::CtEntry;
use super::error::CtMapError;
use super::key::CtKey;
use super::kind::{Family, MapKind, GLOBAL_SUFFIX};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

/// A connection-tracking table that can be opened for scanning.
///
/// Handles are cheap descriptors; the underlying table may or may not exist at the
/// time [`CtMap::open`] is called.
pub trait CtMap: Debug + Send + Sync {
    /// Name of the table (e.g. `cilium_ct4_global`).
    fn name(&self) -> &str;

    /// Family/protocol shard held by the table.
    fn kind(&self) -> MapKind;

    /// Opens the table.
    ///
    /// # Errors
    ///
    /// Returns [`CtMapError::NotPresent`] if the table does not exist, or another
    /// [`CtMapError`] if it exists but cannot be opened.
    fn open(&self) -> Result<Box<dyn OpenCtMap + '_>, CtMapError>;
}

/// An opened connection-tracking table.
///
/// Callers normally hold this through a [`MapGuard`](super::MapGuard), which guarantees
/// [`OpenCtMap::close`] is called exactly once.
pub trait OpenCtMap: Send {
    /// Visits every record currently in the table.
    ///
    /// Records inserted or removed concurrently may or may not be visited.
    ///
    /// # Errors
    ///
    /// Returns an error if the dump cannot be completed.
    fn dump_with_callback(
        &self,
        visit: &mut dyn FnMut(&CtKey, &CtEntry),
    ) -> Result<(), CtMapError>;

    /// Reads the current value of a single record.
    ///
    /// Returns `Ok(None)` if the record no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails.
    fn lookup(&self, key: &CtKey) -> Result<Option<CtEntry>, CtMapError>;

    /// Writes a full value for an existing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn update(&self, key: &CtKey, value: &CtEntry) -> Result<(), CtMapError>;

    /// Releases the handle. Called once; further calls must be no-ops.
    fn close(&mut self);
}

/// Source of the currently active connection-tracking tables.
///
/// The set is not assumed to be static: tables may appear (e.g. a family is enabled at
/// runtime) or disappear between calls.
pub trait MapSet: Send + Sync {
    /// Returns all tables currently known, of every family.
    fn maps(&self) -> Vec<Arc<dyn CtMap>>;
}

impl<T: MapSet + ?Sized> MapSet for Arc<T> {
    fn maps(&self) -> Vec<Arc<dyn CtMap>> {
        (**self).maps()
    }
}

/// Address families to include in an enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Families {
    /// Include IPv4 tables.
    pub ipv4: bool,
    /// Include IPv6 tables.
    pub ipv6: bool,
}

impl Families {
    /// Only IPv4 tables.
    pub const IPV4: Self = Self {
        ipv4: true,
        ipv6: false,
    };
    /// Only IPv6 tables.
    pub const IPV6: Self = Self {
        ipv4: false,
        ipv6: true,
    };
    /// Tables of both families.
    pub const BOTH: Self = Self {
        ipv4: true,
        ipv6: true,
    };

    /// Selects exactly `family`.
    pub const fn only(family: Family) -> Self {
        match family {
            Family::Ipv4 => Self::IPV4,
            Family::Ipv6 => Self::IPV6,
        }
    }

    /// Returns `true` if `family` is selected.
    pub const fn includes(self, family: Family) -> bool {
        match family {
            Family::Ipv4 => self.ipv4,
            Family::Ipv6 => self.ipv6,
        }
    }
}

/// Returns the tables of `set` to search for the selected families.
///
/// Every shard of a selected family is returned (node-wide and per-endpoint, TCP and
/// non-TCP). Duplicate names are dropped. The order is stable: IPv4 before IPv6, TCP
/// before non-TCP, the node-wide table before per-endpoint tables, then by name.
///
/// Nothing here fails: a family with no tables simply contributes nothing.
pub fn enumerate(set: &dyn MapSet, families: Families) -> Vec<Arc<dyn CtMap>> {
    let mut maps: Vec<Arc<dyn CtMap>> = set
        .maps()
        .into_iter()
        .filter(|m| families.includes(m.kind().family))
        .collect();

    maps.sort_by(|a, b| sort_key(a.as_ref()).cmp(&sort_key(b.as_ref())));

    let mut seen = BTreeSet::new();
    maps.retain(|m| seen.insert(m.name().to_owned()));
    maps
}

fn sort_key(map: &dyn CtMap) -> (MapKind, bool, &str) {
    let per_endpoint = MapKind::parse_name(map.name())
        .map_or(true, |(_, scope)| scope != GLOBAL_SUFFIX);
    (map.kind(), per_endpoint, map.name())
}
