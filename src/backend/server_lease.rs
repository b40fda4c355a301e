//! The server-lease protocol, for stores with a native lease API.
//!
//! The store issues the lease id and enforces ownership server-side; this
//! backend only maps the store's status responses onto the crate taxonomy.
//! Conflict (409) on acquisition is normal competition; conflict or a failed
//! precondition (409/412) on renewal means the store no longer recognises
//! the caller as the owner.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{expiry_after, with_cancel, AcquireRequest, Acquired, Backend, ResourceName, StoreError};
use crate::Error;

/// The smallest lease duration the lease API accepts.
pub const MIN_DURATION: Duration = Duration::from_secs(15);

/// The largest finite lease duration the lease API accepts.
pub const MAX_DURATION: Duration = Duration::from_secs(60);

/// The slice of a store's native lease API that this backend drives.
///
/// Adapters surface raw [`StoreError`]s; all taxonomy mapping happens in
/// [`ServerLeaseBackend`].
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Asks the store to issue a lease on the object named by `key`,
    /// returning the server-minted lease id.
    async fn acquire(&self, key: &str, duration: Option<Duration>) -> Result<String, StoreError>;

    /// Extends the lease identified by `lease_id`.
    async fn renew(&self, key: &str, lease_id: &str) -> Result<(), StoreError>;

    /// Releases the lease identified by `lease_id`.
    async fn release(&self, key: &str, lease_id: &str) -> Result<(), StoreError>;

    /// Breaks any active lease on the object regardless of ownership.
    async fn break_lease(&self, key: &str) -> Result<(), StoreError>;

    /// Creates an empty placeholder object so that a lease can be taken on
    /// a target that does not exist yet.
    async fn create_placeholder(&self, key: &str) -> Result<(), StoreError>;
}

/// Configuration for [`ServerLeaseBackend`].
#[derive(Clone, Debug)]
pub struct ServerLeaseOptions {
    /// When acquisition targets an object that does not exist, create an
    /// empty placeholder and retry once.
    pub create_missing_target: bool,
}

/// Drives a [`LeaseStore`].
pub struct ServerLeaseBackend<S> {
    store: S,
    options: ServerLeaseOptions,
}

// === impl ServerLeaseOptions ===

impl Default for ServerLeaseOptions {
    fn default() -> Self {
        Self {
            create_missing_target: true,
        }
    }
}

// === impl ServerLeaseBackend ===

impl<S: LeaseStore> ServerLeaseBackend<S> {
    /// Wraps a store adapter with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, ServerLeaseOptions::default())
    }

    /// Wraps a store adapter.
    pub fn with_options(store: S, options: ServerLeaseOptions) -> Self {
        Self { store, options }
    }

    fn validate_duration(duration: Option<Duration>) -> Result<(), Error> {
        match duration {
            None => Ok(()),
            Some(d) if d >= MIN_DURATION && d <= MAX_DURATION => Ok(()),
            Some(d) => Err(Error::InvalidArgument(format!(
                "lease duration must be between {}s and {}s or infinite, got {}ms",
                MIN_DURATION.as_secs(),
                MAX_DURATION.as_secs(),
                d.as_millis(),
            ))),
        }
    }
}

#[async_trait::async_trait]
impl<S: LeaseStore> Backend for ServerLeaseBackend<S> {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquired>, Error> {
        Self::validate_duration(request.duration)?;

        let key = request.resource.key();
        let mut created_placeholder = false;
        loop {
            let now = Utc::now();
            match with_cancel(cancel, self.store.acquire(key, request.duration)).await? {
                Ok(lease_id) => {
                    debug!(resource = %request.resource, %lease_id, "acquired server lease");
                    return Ok(Some(Acquired {
                        lease_id,
                        resource: request.resource.clone(),
                        owner_tag: request.owner_tag.clone(),
                        acquired_at: now,
                        expires_at: request.duration.map(|d| expiry_after(now, d)),
                        duration: request.duration,
                    }));
                }
                Err(e) if e.is_conflict() => {
                    debug!(resource = %request.resource, "lease held elsewhere");
                    return Ok(None);
                }
                Err(e)
                    if e.is_not_found()
                        && self.options.create_missing_target
                        && !created_placeholder =>
                {
                    debug!(resource = %request.resource, "creating placeholder for lease target");
                    match with_cancel(cancel, self.store.create_placeholder(key)).await? {
                        Ok(()) => created_placeholder = true,
                        // A racing acquirer created it first; the retry below
                        // settles who gets the lease.
                        Err(e) if e.is_conflict() => created_placeholder = true,
                        Err(e) => return Err(Error::Unavailable(e.to_string())),
                    }
                }
                Err(e) => return Err(Error::Unavailable(e.to_string())),
            }
        }
    }

    async fn renew(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>, Error> {
        let now = Utc::now();
        match with_cancel(cancel, self.store.renew(resource.key(), lease_id)).await? {
            Ok(()) => Ok(expiry_after(now, duration)),
            Err(e) if e.is_conflict() || e.is_precondition_failed() => Err(Error::Lost(format!(
                "store no longer recognises lease id for '{resource}'"
            ))),
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }

    async fn release(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match with_cancel(cancel, self.store.release(resource.key(), lease_id)).await? {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_conflict() => Ok(()),
            Err(e) => {
                // The lease will expire on its own.
                warn!(%resource, error = %e, "suppressed release failure");
                Ok(())
            }
        }
    }

    async fn break_lease(
        &self,
        resource: &ResourceName,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match with_cancel(cancel, self.store.break_lease(resource.key())).await? {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_conflict() => Ok(()),
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }
}
