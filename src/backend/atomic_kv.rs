//! The atomic key-value protocol, for stores with set-if-absent and
//! scripted compare-and-modify primitives.
//!
//! Acquisition is a single `SET key=lease_id NX PX=duration` round; renewal
//! and release are compare-and-expire / compare-and-delete scripts keyed by
//! the lease id. Because the store expires the key on its own clock, the
//! reported validity is shortened by a drift allowance so a holder never
//! believes it owns a lease the store has already expired.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{expiry_after, with_cancel, AcquireRequest, Acquired, Backend, ResourceName, StoreError};
use crate::Error;

/// The key-value operations this backend drives. All four must be atomic at
/// the store.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Sets `key` to `value` with the given time-to-live only if the key is
    /// absent. Returns false when the key exists.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Resets the key's time-to-live only if its value equals `value`.
    /// Returns false otherwise.
    async fn extend_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Deletes the key only if its value equals `value`. Returns false
    /// otherwise.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Deletes the key unconditionally.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Configuration for [`AtomicKvBackend`].
#[derive(Clone, Debug)]
pub struct AtomicKvOptions {
    /// Fraction of the nominal duration surrendered to clock drift.
    pub drift_factor: f64,

    /// Fixed drift allowance added on top of the factor.
    pub drift_constant: Duration,

    /// The effective validity an acquisition must clear; acquisitions whose
    /// drift-adjusted validity falls at or below this are undone and
    /// reported as unacquired.
    pub min_validity: Duration,
}

/// Drives a [`KvStore`].
pub struct AtomicKvBackend<S> {
    store: S,
    options: AtomicKvOptions,
}

// === impl AtomicKvOptions ===

impl Default for AtomicKvOptions {
    fn default() -> Self {
        Self {
            drift_factor: 0.01,
            drift_constant: Duration::from_millis(2),
            min_validity: Duration::ZERO,
        }
    }
}

// === impl AtomicKvBackend ===

impl<S: KvStore> AtomicKvBackend<S> {
    /// Wraps a store adapter with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, AtomicKvOptions::default())
    }

    /// Wraps a store adapter.
    pub fn with_options(store: S, options: AtomicKvOptions) -> Self {
        Self { store, options }
    }

    /// The drift-adjusted validity of a nominal duration, or `None` when
    /// the drift allowance consumes more than the lease grants.
    fn effective_validity(&self, duration: Duration) -> Option<Duration> {
        let drift = duration.mul_f64(self.options.drift_factor) + self.options.drift_constant;
        let validity = duration.checked_sub(drift)?;
        (validity > self.options.min_validity).then_some(validity)
    }
}

#[async_trait::async_trait]
impl<S: KvStore> Backend for AtomicKvBackend<S> {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquired>, Error> {
        let key = request.resource.key();
        let lease_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let set = with_cancel(cancel, self.store.put_if_absent(key, &lease_id, request.duration))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        if !set {
            debug!(resource = %request.resource, "key already leased");
            return Ok(None);
        }

        let validity = match request.duration {
            None => None,
            Some(duration) => match self.effective_validity(duration) {
                Some(validity) => Some(validity),
                None => {
                    warn!(
                        resource = %request.resource,
                        duration_ms = duration.as_millis() as u64,
                        "lease duration does not clear the clock-drift allowance; undoing acquisition"
                    );
                    // Best effort: the key expires on its own if this fails.
                    let _ = with_cancel(cancel, self.store.delete_if_value(key, &lease_id)).await;
                    return Ok(None);
                }
            },
        };

        debug!(resource = %request.resource, %lease_id, "acquired key lease");
        Ok(Some(Acquired {
            lease_id,
            resource: request.resource.clone(),
            owner_tag: request.owner_tag.clone(),
            acquired_at: now,
            expires_at: validity.map(|v| expiry_after(now, v)),
            duration: request.duration,
        }))
    }

    async fn renew(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>, Error> {
        let now = Utc::now();
        let extended = with_cancel(
            cancel,
            self.store
                .extend_if_value(resource.key(), lease_id, Some(duration)),
        )
        .await?
        .map_err(|e| Error::Unavailable(e.to_string()))?;

        if !extended {
            return Err(Error::Lost(format!(
                "key for '{resource}' no longer carries this lease id"
            )));
        }
        let validity = self.effective_validity(duration).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "lease duration {}ms does not clear the clock-drift allowance",
                duration.as_millis(),
            ))
        })?;
        Ok(expiry_after(now, validity))
    }

    async fn release(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        // False means the key is gone or re-owned, which is a successful
        // release either way.
        with_cancel(cancel, self.store.delete_if_value(resource.key(), lease_id))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn break_lease(
        &self,
        resource: &ResourceName,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        with_cancel(cancel, self.store.delete(resource.key()))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn backend() -> AtomicKvBackend<crate::backend::memory::InMemoryKvStore> {
        AtomicKvBackend::new(crate::backend::memory::InMemoryKvStore::new())
    }

    #[test]
    fn validity_is_shortened_by_drift() {
        let backend = backend();
        let validity = backend
            .effective_validity(Duration::from_secs(10))
            .expect("valid");
        // 10s - (1% of 10s + 2ms)
        assert_eq!(validity, Duration::from_millis(9898));
    }

    #[test]
    fn validity_must_clear_the_minimum() {
        let store = crate::backend::memory::InMemoryKvStore::new();
        let backend = AtomicKvBackend::with_options(
            store,
            AtomicKvOptions {
                drift_factor: 0.01,
                drift_constant: Duration::from_millis(2),
                min_validity: Duration::from_secs(5),
            },
        );
        assert!(backend.effective_validity(Duration::from_secs(5)).is_none());
        assert!(backend.effective_validity(Duration::from_secs(6)).is_some());
    }

    #[tokio::test]
    async fn acquisition_below_minimum_validity_is_undone() {
        let store = crate::backend::memory::InMemoryKvStore::new();
        let strict = AtomicKvBackend::with_options(
            store.clone(),
            AtomicKvOptions {
                drift_factor: 0.5,
                drift_constant: Duration::from_millis(0),
                min_validity: Duration::from_secs(30),
            },
        );
        let cancel = CancellationToken::new();
        let request = AcquireRequest {
            resource: ResourceName::new("res-kv").expect("name"),
            duration: Some(Duration::from_secs(40)),
            owner_tag: None,
            metadata: Default::default(),
        };

        let got = strict.acquire(&request, &cancel).await.expect("acquire");
        assert!(got.is_none(), "validity 20s does not clear 30s minimum");

        // The undo leaves the key free for a properly-configured acquirer.
        let relaxed = AtomicKvBackend::new(store);
        let got = relaxed.acquire(&request, &cancel).await.expect("acquire");
        assert!(got.is_some(), "undone acquisition must not hold the key");
    }
}
