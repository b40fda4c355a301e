//! The lease manager: the front end callers acquire through.
//!
//! A manager owns one backend driver for its lifetime, validates inputs
//! before any store traffic, and applies the blocking-acquire retry policy.
//! Handles it returns are independent of the manager and may outlive it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{AcquireRequest, Backend, ResourceName};
use crate::renewal::RenewalConfig;
use crate::{Error, Lease};

/// A lease duration: finite, or the infinite sentinel.
///
/// Infinite leases never expire, so the auto-renewal engine is disabled for
/// them; they are freed only by release or an administrative break.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseDuration {
    /// A lease that lapses unless renewed.
    Finite(Duration),

    /// A lease that never lapses.
    Infinite,
}

/// Configuration for a [`LeaseManager`].
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Duration used when an acquisition does not name one.
    pub default_duration: LeaseDuration,

    /// Delay between attempts inside [`LeaseManager::acquire`].
    pub acquire_retry_interval: Duration,

    /// Start an auto-renewal engine for every finite lease acquired.
    pub auto_renew: bool,

    /// Tuning for the auto-renewal engine.
    pub renewal: RenewalConfig,

    /// Free-form holder identity (hostname, region) recorded with every
    /// acquisition. Never used for ownership decisions.
    pub owner_tag: Option<String>,

    /// Metadata persisted by backends that store documents.
    pub metadata: HashMap<String, String>,
}

/// Coordinates acquisitions against one backend.
pub struct LeaseManager {
    backend: Arc<dyn Backend>,
    options: ManagerOptions,
}

// === impl LeaseDuration ===

impl From<Duration> for LeaseDuration {
    fn from(d: Duration) -> Self {
        Self::Finite(d)
    }
}

impl LeaseDuration {
    fn resolve(self) -> Result<Option<Duration>, Error> {
        match self {
            Self::Infinite => Ok(None),
            Self::Finite(d) if d > Duration::ZERO => Ok(Some(d)),
            Self::Finite(_) => Err(Error::InvalidArgument(
                "lease duration must be positive".to_string(),
            )),
        }
    }
}

// === impl ManagerOptions ===

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_duration: LeaseDuration::Finite(Duration::from_secs(30)),
            acquire_retry_interval: Duration::from_secs(1),
            auto_renew: true,
            renewal: RenewalConfig::default(),
            owner_tag: None,
            metadata: HashMap::new(),
        }
    }
}

// === impl LeaseManager ===

impl LeaseManager {
    /// Creates a manager with default options.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_options(backend, ManagerOptions::default())
    }

    /// Creates a manager.
    pub fn with_options(backend: Arc<dyn Backend>, options: ManagerOptions) -> Self {
        Self { backend, options }
    }

    /// The options this manager was built with.
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Makes a single acquisition attempt.
    ///
    /// Returns `Ok(None)` when the resource is held by someone else, a
    /// normal competition outcome rather than an error. Only infrastructure
    /// problems fail.
    pub async fn try_acquire(
        &self,
        name: &str,
        duration: Option<LeaseDuration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, Error> {
        let request = self.request_for(name, duration)?;
        // Resolve the renewal plan up front so configuration errors surface
        // before any store traffic.
        let plan = match (self.options.auto_renew, request.duration) {
            (true, Some(d)) => Some(self.options.renewal.plan(d)?),
            _ => None,
        };

        match self.backend.acquire(&request, cancel).await? {
            Some(acquired) => {
                info!(resource = %acquired.resource, lease_id = %acquired.lease_id, "lease acquired");
                Ok(Some(Lease::new(self.backend.clone(), acquired, plan)))
            }
            None => {
                debug!(resource = %request.resource, "resource is held elsewhere");
                Ok(None)
            }
        }
    }

    /// Acquires the lease, retrying while the resource is held elsewhere.
    ///
    /// `timeout` bounds the whole call on a monotonic clock; `None` waits
    /// indefinitely, and zero makes exactly one attempt. Competition is
    /// retried, whether reported as `None` or thrown as
    /// [`Error::Conflict`]; other failures surface immediately.
    pub async fn acquire(
        &self,
        name: &str,
        duration: Option<LeaseDuration>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Lease, Error> {
        let start = Instant::now();
        loop {
            match self.try_acquire(name, duration, cancel).await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) | Err(Error::Conflict) => {}
                Err(
                    e @ (Error::Canceled
                    | Error::Unavailable(_)
                    | Error::InvalidArgument(_)
                    | Error::Acquisition(_)),
                ) => return Err(e),
                Err(e) => {
                    return Err(Error::Acquisition(format!(
                        "unexpected failure acquiring '{name}': {e}"
                    )))
                }
            }

            let sleep = match timeout {
                None => self.options.acquire_retry_interval,
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        return Err(Error::Acquisition(format!(
                            "timed out after {}ms waiting to acquire lease '{name}'",
                            timeout.as_millis(),
                        )));
                    }
                    self.options.acquire_retry_interval.min(remaining)
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Force-releases the named resource regardless of ownership.
    pub async fn break_lease(&self, name: &str, cancel: &CancellationToken) -> Result<(), Error> {
        let resource = ResourceName::new(name)?;
        info!(%resource, "breaking lease");
        self.backend.break_lease(&resource, cancel).await
    }

    fn request_for(
        &self,
        name: &str,
        duration: Option<LeaseDuration>,
    ) -> Result<AcquireRequest, Error> {
        let resource = ResourceName::new(name)?;
        let duration = duration.unwrap_or(self.options.default_duration).resolve()?;
        Ok(AcquireRequest {
            resource,
            duration,
            owner_tag: self.options.owner_tag.clone(),
            metadata: self.options.metadata.clone(),
        })
    }
}
