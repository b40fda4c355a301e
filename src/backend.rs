//! The backend driver contract.
//!
//! A backend speaks one coordination store's native lease or compare-and-swap
//! protocol and normalises its responses into the crate's error taxonomy.
//! Three protocols are provided: server-side leases ([`server_lease`]),
//! optimistic-concurrency documents ([`document`]), and atomic key-value
//! operations ([`atomic_kv`]), plus in-process reference stores ([`memory`])
//! for tests and single-process use.
//!
//! Backends are shared by many handles and hold no per-lease state; every
//! renew and release carries the lease id minted at acquisition.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub mod atomic_kv;
pub mod document;
pub mod memory;
pub mod server_lease;

/// A validated resource name and its normalised store key.
///
/// Store keys are the lowercased name with each whitespace character
/// replaced by `-`; the original spelling is preserved for display and
/// metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceName {
    name: String,
    key: String,
}

/// Inputs to a single acquisition attempt.
#[derive(Clone, Debug)]
pub struct AcquireRequest {
    /// The resource to claim.
    pub resource: ResourceName,

    /// The lease duration; `None` is the infinite-duration sentinel.
    pub duration: Option<Duration>,

    /// Free-form holder metadata (hostname, region). Never consulted for
    /// ownership decisions.
    pub owner_tag: Option<String>,

    /// Additional metadata persisted by backends that store documents.
    pub metadata: HashMap<String, String>,
}

/// The record a backend returns for a successful acquisition.
#[derive(Clone, Debug)]
pub struct Acquired {
    /// The opaque ownership token to present on every renew and release.
    pub lease_id: String,

    /// The resource that was claimed.
    pub resource: ResourceName,

    /// The owner tag echoed from the request.
    pub owner_tag: Option<String>,

    /// When the claim took effect.
    pub acquired_at: DateTime<Utc>,

    /// When the claim lapses unless renewed; `None` for infinite leases.
    pub expires_at: Option<DateTime<Utc>>,

    /// The nominal lease duration; `None` for infinite leases.
    pub duration: Option<Duration>,
}

/// A driver for one coordination store.
///
/// Acquisition reports competition by returning `Ok(None)`; only
/// infrastructure problems are errors. `release` and `break_lease` are
/// idempotent. Every operation honours the caller's cancellation token.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Attempts to claim the resource, returning `None` when it is held by
    /// someone else.
    async fn acquire(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquired>, Error>;

    /// Extends the lease, returning the new expiry.
    ///
    /// Fails with [`Error::Lost`] when the store no longer recognises the
    /// lease id as the owner of the resource.
    async fn renew(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>, Error>;

    /// Releases the lease if it is still owned; succeeds silently when the
    /// record is gone or owned by someone else.
    async fn release(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    /// Force-releases the resource regardless of ownership.
    async fn break_lease(
        &self,
        resource: &ResourceName,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;
}

/// A raw store failure, expressed as an HTTP-style status and message.
///
/// Store adapters surface these untranslated; each backend protocol maps
/// them onto the crate taxonomy (conflict vs. loss vs. unavailability).
#[derive(Clone, Debug, thiserror::Error)]
#[error("store responded {status}: {message}")]
pub struct StoreError {
    /// The store's status code.
    pub status: http::StatusCode,

    /// The store's diagnostic message.
    pub message: String,
}

// === impl ResourceName ===

impl ResourceName {
    /// Validates a caller-supplied name and derives its store key.
    pub fn new(name: impl AsRef<str>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "resource name must not be empty".to_string(),
            ));
        }
        let key = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { '-' } else { c })
            .collect();
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    /// The name as the caller supplied it.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The normalised key used for store lookups.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl std::str::FromStr for ResourceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::new(s)
    }
}

// === impl StoreError ===

impl StoreError {
    /// A failure with an explicit status code.
    pub fn new(status: http::StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    /// A transport-level failure (the store could not be reached).
    pub fn unavailable(message: impl ToString) -> Self {
        Self::new(http::StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// The store rejected the write because another owner holds the
    /// resource or raced the caller.
    pub fn conflict(message: impl ToString) -> Self {
        Self::new(http::StatusCode::CONFLICT, message)
    }

    /// The record does not exist.
    pub fn not_found(message: impl ToString) -> Self {
        Self::new(http::StatusCode::NOT_FOUND, message)
    }

    /// A conditional write observed a stale version token.
    pub fn precondition_failed(message: impl ToString) -> Self {
        Self::new(http::StatusCode::PRECONDITION_FAILED, message)
    }

    /// Returns true for 409 responses.
    pub fn is_conflict(&self) -> bool {
        self.status == http::StatusCode::CONFLICT
    }

    /// Returns true for 404 responses.
    pub fn is_not_found(&self) -> bool {
        self.status == http::StatusCode::NOT_FOUND
    }

    /// Returns true for 412 responses.
    pub fn is_precondition_failed(&self) -> bool {
        self.status == http::StatusCode::PRECONDITION_FAILED
    }
}

/// Races a store call against the caller's cancellation token.
pub(crate) async fn with_cancel<F>(cancel: &CancellationToken, call: F) -> Result<F::Output, Error>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Canceled),
        out = call => Ok(out),
    }
}

/// Computes the wall-clock expiry for a lease term starting now, saturating
/// on durations the calendar cannot represent.
pub(crate) fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod test {
    use super::ResourceName;

    #[test]
    fn normalizes_keys() {
        let name = ResourceName::new("Payments Region EU").expect("valid name");
        assert_eq!(name.as_str(), "Payments Region EU");
        assert_eq!(name.key(), "payments-region-eu");
    }

    #[test]
    fn rejects_blank_names() {
        assert!(ResourceName::new("").is_err());
        assert!(ResourceName::new("   ").is_err());
        assert!(ResourceName::new("\t\n").is_err());
    }

    #[test]
    fn preserves_dashes_and_case_mapping() {
        let name = ResourceName::new("Res-A").expect("valid name");
        assert_eq!(name.key(), "res-a");
    }
}
