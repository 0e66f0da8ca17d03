#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! This library marks connection-tracking records as authenticated once mutual
//! authentication for their flow has completed.
//!
//! The dataplane holds one record per tracked flow in tables sharded by address family
//! and protocol. A flow that requires authentication carries `AUTH_REQUIRED`; its traffic
//! is held until the control plane sets `AUTH_OK` on the record. This crate finds the
//! records of exactly the authenticated flow and sets that bit, preserving every other
//! field, and retries when the record has not been created yet.
//!
//! Table backends plug in through the [`ctmap::MapSet`], [`ctmap::CtMap`] and
//! [`ctmap::OpenCtMap`] traits. [`ctmap::memory`] provides an in-process backend.
//!
//! # Examples
//!
//! ```rust
//! use conntrack_auth::ctmap::memory::InMemoryMapSet;
//! use conntrack_auth::ctmap::{CtEntry, CtFlags, CtKey, FlowTuple, MapKind, TupleFlags, IPPROTO_TCP};
//! use conntrack_auth::{AuthRequest, CtMapAuthenticator};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let maps = Arc::new(InMemoryMapSet::with_global_maps());
//!
//! // The dataplane created a record for a flow that needs authentication.
//! let flow = FlowTuple {
//!     source_addr: "10.0.0.1".parse()?,
//!     dest_addr: "10.0.0.2".parse()?,
//!     source_port: 41000,
//!     dest_port: 443,
//!     protocol: IPPROTO_TCP,
//! };
//! let key = CtKey::from_tuple(&flow, TupleFlags::OUT).ok_or("mixed families")?;
//! let table = maps.global(MapKind::IPV4_TCP).ok_or("missing table")?;
//! table.insert(key, CtEntry { flags: CtFlags::AUTH_REQUIRED, ..CtEntry::default() });
//!
//! // Authentication completed; propagate it.
//! let authenticator = CtMapAuthenticator::builder(maps).max_attempts(3).build();
//! let done = authenticator.mark_authenticated(&AuthRequest::new(flow)?).await?;
//!
//! assert_eq!(done.updated, 1);
//! assert!(table.get(&key).ok_or("record vanished")?.is_authenticated());
//! # Ok(())
//! # }
//! ```

mod backoff;
mod observability;
mod prelude;

pub mod auth;
pub mod ctmap;

pub use auth::{
    AuthError, AuthManager, AuthRequest, AuthSuccess, AuthTicket, AuthenticatorBuilder,
    CtMapAuthenticator, RetryConfig,
};
pub use ctmap::{CtEntry, CtFlags, CtKey, CtMapError, FlowTuple};
