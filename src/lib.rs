//! Distributed leases: time-bounded exclusive claims on named resources.
//!
//! A lease is a renewable claim on a resource name, backed by a remote
//! coordination store; while the claim is live its holder is the sole
//! legitimate actor on that resource. Typical uses are leader election,
//! singleton jobs, and cross-instance critical sections.
//!
//! The pieces compose bottom-up:
//!
//! - [`backend`]: drivers that speak one store's native protocol
//!   (server-side leases, versioned documents, atomic key-value) and
//!   normalise its failures into one taxonomy;
//! - [`Lease`]: the per-acquisition handle, with manual renew, idempotent
//!   release, lifecycle events, and an optional background auto-renewal
//!   engine;
//! - [`LeaseManager`]: the front end with validation, single-shot
//!   `try_acquire`, and blocking `acquire` with a retry/timeout budget;
//! - [`chaos`]: a decorator that injects configurable faults into any
//!   backend, for resilience testing.
//!
//! Acquisition never treats competition as an error: `try_acquire` returns
//! `None` while someone else holds the resource, and errors are reserved
//! for infrastructure problems.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod chaos;
mod error;
mod lease;
mod manager;
mod renewal;

pub use self::error::Error;
pub use self::lease::{active_leases, Lease, LeaseEvent, LeaseState};
pub use self::manager::{LeaseDuration, LeaseManager, ManagerOptions};
pub use self::renewal::{RenewalConfig, DEFAULT_SAFETY_THRESHOLD};
