//! Propagating completed authentication into connection-tracking records.
//!
//! When mutual authentication for a flow completes, the dataplane must be told so it
//! stops holding the flow's packets. [`CtMapAuthenticator`] does this by setting
//! `AUTH_OK` on the flow's records. Because the record may not exist yet when
//! authentication finishes, the search is retried a bounded number of times.
//!
//! [`AuthManager`] runs requests on background tasks, one per flow.
//!
//! Primary types are re-exported at the crate root. For the metrics and event types
//! (`MetricsRecorder`, `AuthEvent`, `MetricsErrorKind`), import from this module.
//!
//! # Example
//!
//! ```rust
//! use conntrack_auth::auth::{AuthRequest, CtMapAuthenticator};
//! use conntrack_auth::ctmap::memory::InMemoryMapSet;
//! use conntrack_auth::ctmap::{FlowTuple, IPPROTO_TCP};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let authenticator = CtMapAuthenticator::builder(Arc::new(InMemoryMapSet::with_global_maps()))
//!     .max_attempts(10)
//!     .retry_interval(Duration::from_secs(1))
//!     .build();
//!
//! let flow = FlowTuple {
//!     source_addr: "10.0.0.1".parse()?,
//!     dest_addr: "10.0.0.2".parse()?,
//!     source_port: 41000,
//!     dest_port: 443,
//!     protocol: IPPROTO_TCP,
//! };
//! match authenticator.mark_authenticated(&AuthRequest::new(flow)?).await {
//!     Ok(done) => println!("marked {} records", done.updated),
//!     Err(e) => eprintln!("could not propagate auth: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

mod authenticator;
mod builder;
mod errors;
mod manager;
mod matcher;
mod metrics;
mod request;
mod retry;

pub use authenticator::{AuthSuccess, CtMapAuthenticator};
pub use builder::{AuthenticatorBuilder, RetryConfig};
pub use errors::{AuthError, AuthRequestError, ManagerError, MetricsErrorKind, SubmitError};
pub use manager::{AuthManager, AuthTicket};
pub use matcher::{FlowMatcher, Matcher};
pub use metrics::{AuthEvent, AuthEventOutcome, MetricsRecorder};
pub use request::AuthRequest;
