//! Connection-tracking tables: data model, enumeration and scanning.
//!
//! The dataplane keeps one record per tracked flow in tables sharded by address family
//! and protocol (and optionally per endpoint). This module provides:
//!
//! - the record types ([`CtKey`], [`CtEntry`], [`CtFlags`])
//! - the capability surface a table backend implements ([`MapSet`], [`CtMap`], [`OpenCtMap`])
//! - [`enumerate`], which selects the tables to search
//! - [`scan`], which streams a table and patches selected records in place
//! - [`memory`], an in-process backend
//!
//! # Example
//!
//! ```rust
//! use conntrack_auth::ctmap::memory::InMemoryMapSet;
//! use conntrack_auth::ctmap::{enumerate, scan, CtEntry, Families};
//!
//! let set = InMemoryMapSet::with_global_maps();
//! let mut needing_auth = 0;
//! for map in enumerate(&set, Families::IPV4) {
//!     scan(map.as_ref(), |_key, entry: &CtEntry| {
//!         if entry.needs_auth() {
//!             needing_auth += 1;
//!         }
//!         None
//!     })?;
//! }
//! assert_eq!(needing_auth, 0);
//! # Ok::<(), conntrack_auth::ctmap::CtMapError>(())
//! ```

mod entry;
mod error;
mod flags;
mod key;
mod kind;
mod maps;
pub mod memory;
mod scanner;

pub use entry::{CtEntry, EntryPatch};
pub use error::CtMapError;
pub use flags::CtFlags;
pub use key::{CtKey, CtKey4, CtKey6, FlowKey, FlowTuple, TupleFlags, IPPROTO_TCP, IPPROTO_UDP};
pub use kind::{Family, MapKind, MapProtocol, GLOBAL_SUFFIX, MAP_NAME_PREFIX};
pub use maps::{enumerate, CtMap, Families, MapSet, OpenCtMap};
pub use scanner::{scan, MapGuard, ScanSummary};
