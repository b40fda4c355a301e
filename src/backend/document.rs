//! The document-CAS protocol, for stores that record leases as mutable
//! documents guarded by a version token.
//!
//! Every write is conditioned on the version observed by the preceding
//! read; a mismatch means another acquirer won the race. Documents carry a
//! TTL (a multiple of the lease duration) so the store reaps records left
//! behind by crashed holders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{expiry_after, with_cancel, AcquireRequest, Acquired, Backend, ResourceName, StoreError};
use crate::Error;

/// The persisted lease record.
///
/// This schema is the wire format for document stores; changing it is a
/// backward-incompatible protocol change. Keys are camelCase, timestamps
/// ISO-8601 UTC, `ttl` in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDocument {
    /// The normalised resource key; also the document id.
    pub id: String,

    /// The resource name as the caller supplied it.
    pub lease_name: String,

    /// The ownership token minted at acquisition.
    pub lease_id: String,

    /// Free-form holder metadata.
    pub owner_tag: Option<String>,

    /// When the current term began.
    pub acquired_at: DateTime<Utc>,

    /// When the claim lapses; `None` for infinite leases.
    pub expires_at: Option<DateTime<Utc>>,

    /// The nominal duration in whole seconds; `None` for infinite leases.
    pub duration_seconds: Option<u64>,

    /// Successful renewals of the current claim.
    pub renewal_count: u64,

    /// The most recent successful renewal.
    pub last_renewed_at: Option<DateTime<Utc>>,

    /// Caller-supplied metadata.
    pub metadata: HashMap<String, String>,

    /// The store-supplied optimistic-concurrency token; absent on documents
    /// that have not been persisted yet.
    pub version: Option<String>,

    /// Server-side cleanup deadline, in seconds.
    pub ttl: Option<i64>,
}

/// The document operations this backend drives.
///
/// `create` fails with a conflict when a document with the same id exists;
/// `replace` fails with a precondition failure when the version token is
/// stale. Both return the stored document with its new version token.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Reads a document by id.
    async fn get(&self, key: &str) -> Result<Option<LeaseDocument>, StoreError>;

    /// Creates a document, failing with a conflict if the id is taken.
    async fn create(&self, doc: &LeaseDocument) -> Result<LeaseDocument, StoreError>;

    /// Replaces a document conditioned on its version token.
    async fn replace(
        &self,
        key: &str,
        doc: &LeaseDocument,
        version: &str,
    ) -> Result<LeaseDocument, StoreError>;

    /// Deletes a document by id, failing with not-found if it is absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Configuration for [`DocumentCasBackend`].
#[derive(Clone, Debug)]
pub struct DocumentOptions {
    /// TTL multiplier applied to the lease duration. Values below 5 risk
    /// the store reaping a record that is still being retried.
    pub ttl_factor: u32,
}

/// Drives a [`DocumentStore`].
pub struct DocumentCasBackend<S> {
    store: S,
    options: DocumentOptions,
}

// === impl DocumentOptions ===

impl Default for DocumentOptions {
    fn default() -> Self {
        Self { ttl_factor: 5 }
    }
}

// === impl DocumentCasBackend ===

impl<S: DocumentStore> DocumentCasBackend<S> {
    /// Wraps a store adapter with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, DocumentOptions::default())
    }

    /// Wraps a store adapter.
    pub fn with_options(store: S, options: DocumentOptions) -> Self {
        Self { store, options }
    }

    fn new_document(&self, request: &AcquireRequest, now: DateTime<Utc>) -> LeaseDocument {
        LeaseDocument {
            id: request.resource.key().to_string(),
            lease_name: request.resource.as_str().to_string(),
            lease_id: uuid::Uuid::new_v4().to_string(),
            owner_tag: request.owner_tag.clone(),
            acquired_at: now,
            expires_at: request.duration.map(|d| expiry_after(now, d)),
            duration_seconds: request.duration.map(|d| d.as_secs()),
            renewal_count: 0,
            last_renewed_at: None,
            metadata: request.metadata.clone(),
            version: None,
            ttl: self.ttl_for(request.duration),
        }
    }

    fn ttl_for(&self, duration: Option<Duration>) -> Option<i64> {
        duration.map(|d| d.as_secs() as i64 * i64::from(self.options.ttl_factor))
    }

    fn acquired_from(doc: &LeaseDocument, resource: &ResourceName) -> Acquired {
        Acquired {
            lease_id: doc.lease_id.clone(),
            resource: resource.clone(),
            owner_tag: doc.owner_tag.clone(),
            acquired_at: doc.acquired_at,
            expires_at: doc.expires_at,
            duration: doc.duration_seconds.map(Duration::from_secs),
        }
    }
}

#[async_trait::async_trait]
impl<S: DocumentStore> Backend for DocumentCasBackend<S> {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquired>, Error> {
        let key = request.resource.key();
        let now = Utc::now();

        let current = with_cancel(cancel, self.store.get(key))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?;

        match current {
            None => {
                let doc = self.new_document(request, now);
                match with_cancel(cancel, self.store.create(&doc)).await? {
                    Ok(stored) => {
                        debug!(resource = %request.resource, lease_id = %stored.lease_id, "created lease document");
                        Ok(Some(Self::acquired_from(&stored, &request.resource)))
                    }
                    // A concurrent create won the race.
                    Err(e) if e.is_conflict() => Ok(None),
                    Err(e) => Err(Error::Unavailable(e.to_string())),
                }
            }
            Some(doc) => {
                let held = match doc.expires_at {
                    Some(expires_at) => expires_at > now,
                    // An infinite lease never lapses on its own.
                    None => true,
                };
                if held {
                    return Ok(None);
                }

                let version = match doc.version.as_deref() {
                    Some(v) => v.to_string(),
                    None => {
                        return Err(Error::Unavailable(
                            "store returned a document without a version token".to_string(),
                        ))
                    }
                };
                let replacement = self.new_document(request, now);
                match with_cancel(cancel, self.store.replace(key, &replacement, &version)).await? {
                    Ok(stored) => {
                        debug!(resource = %request.resource, lease_id = %stored.lease_id, "took over expired lease document");
                        Ok(Some(Self::acquired_from(&stored, &request.resource)))
                    }
                    // Someone else replaced or deleted the record first.
                    Err(e) if e.is_precondition_failed() || e.is_conflict() || e.is_not_found() => {
                        Ok(None)
                    }
                    Err(e) => Err(Error::Unavailable(e.to_string())),
                }
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
        let key = resource.key();
        let now = Utc::now();

        let doc = with_cancel(cancel, self.store.get(key))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .ok_or_else(|| Error::Lost(format!("lease record for '{resource}' is gone")))?;

        if doc.lease_id != lease_id {
            return Err(Error::Lost(format!(
                "lease on '{resource}' is now owned by another holder"
            )));
        }
        let version = doc.version.clone().ok_or_else(|| {
            Error::Unavailable("store returned a document without a version token".to_string())
        })?;

        let expires_at = expiry_after(now, duration);
        let updated = LeaseDocument {
            expires_at: Some(expires_at),
            duration_seconds: Some(duration.as_secs()),
            renewal_count: doc.renewal_count + 1,
            last_renewed_at: Some(now),
            ttl: self.ttl_for(Some(duration)),
            ..doc
        };
        match with_cancel(cancel, self.store.replace(key, &updated, &version)).await? {
            Ok(_) => Ok(expires_at),
            Err(e) if e.is_precondition_failed() || e.is_conflict() || e.is_not_found() => {
                Err(Error::Lost(format!(
                    "lease on '{resource}' was modified by another holder"
                )))
            }
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }

    async fn release(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let key = resource.key();

        let doc = with_cancel(cancel, self.store.get(key))
            .await?
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        match doc {
            // Already gone, or re-acquired by someone else.
            None => Ok(()),
            Some(doc) if doc.lease_id != lease_id => Ok(()),
            Some(_) => match with_cancel(cancel, self.store.delete(key)).await? {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(Error::Unavailable(e.to_string())),
            },
        }
    }

    async fn break_lease(
        &self,
        resource: &ResourceName,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        match with_cancel(cancel, self.store.delete(resource.key())).await? {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }
}
