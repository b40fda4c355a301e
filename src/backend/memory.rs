//! In-process reference stores for the three backend protocols.
//!
//! These honour expiry, version tokens, and TTL reaping on the process
//! clock, so the full lease lifecycle can be exercised without a remote
//! store. They are used by this crate's tests and are suitable for
//! single-process coordination; they provide no durability.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::atomic_kv::KvStore;
use super::document::{DocumentStore, LeaseDocument};
use super::server_lease::LeaseStore;
use super::{expiry_after, StoreError};

/// An in-process [`LeaseStore`].
///
/// Lease targets must exist before a lease can be taken on them, matching
/// stores whose leases attach to objects; [`ServerLeaseBackend`] creates
/// placeholders on demand when configured to.
///
/// [`ServerLeaseBackend`]: super::server_lease::ServerLeaseBackend
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    objects: Arc<Mutex<HashMap<String, ObjectState>>>,
}

#[derive(Default)]
struct ObjectState {
    lease: Option<LeaseRecord>,
}

struct LeaseRecord {
    lease_id: String,
    duration: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
}

/// An in-process [`DocumentStore`] with monotonically increasing version
/// tokens and TTL reaping.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<DocumentState>>,
}

#[derive(Default)]
struct DocumentState {
    documents: HashMap<String, StoredDocument>,
    next_version: u64,
}

struct StoredDocument {
    doc: LeaseDocument,
    reap_at: Option<DateTime<Utc>>,
}

/// An in-process [`KvStore`] with per-key expiry.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<String, KvEntry>>>,
}

struct KvEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

// === impl InMemoryLeaseStore ===

impl InMemoryLeaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given lease targets already present.
    pub fn with_objects<I: IntoIterator<Item = S>, S: ToString>(keys: I) -> Self {
        let store = Self::new();
        {
            let mut objects = store.objects.lock();
            for key in keys {
                objects.insert(key.to_string(), ObjectState::default());
            }
        }
        store
    }
}

impl LeaseRecord {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

#[async_trait::async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &str, duration: Option<Duration>) -> Result<String, StoreError> {
        let now = Utc::now();
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("no object '{key}'")))?;

        if object.lease.as_ref().is_some_and(|l| l.is_active(now)) {
            return Err(StoreError::conflict("object already leased"));
        }

        let lease_id = uuid::Uuid::new_v4().to_string();
        object.lease = Some(LeaseRecord {
            lease_id: lease_id.clone(),
            duration,
            expires_at: duration.map(|d| expiry_after(now, d)),
        });
        Ok(lease_id)
    }

    async fn renew(&self, key: &str, lease_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("no object '{key}'")))?;

        match object.lease.as_mut() {
            Some(lease) if lease.lease_id == lease_id && lease.is_active(now) => {
                lease.expires_at = lease.duration.map(|d| expiry_after(now, d));
                Ok(())
            }
            _ => Err(StoreError::conflict("lease id does not match")),
        }
    }

    async fn release(&self, key: &str, lease_id: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("no object '{key}'")))?;

        match object.lease.as_ref() {
            Some(lease) if lease.lease_id == lease_id => {
                object.lease = None;
                Ok(())
            }
            _ => Err(StoreError::conflict("lease id does not match")),
        }
    }

    async fn break_lease(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(format!("no object '{key}'")))?;
        object.lease = None;
        Ok(())
    }

    async fn create_placeholder(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        if objects.contains_key(key) {
            return Err(StoreError::conflict(format!("object '{key}' exists")));
        }
        objects.insert(key.to_string(), ObjectState::default());
        Ok(())
    }
}

// === impl InMemoryDocumentStore ===

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentState {
    fn reap(&mut self, now: DateTime<Utc>) {
        self.documents
            .retain(|_, stored| stored.reap_at.map_or(true, |at| at > now));
    }

    fn store(&mut self, key: &str, mut doc: LeaseDocument, now: DateTime<Utc>) -> LeaseDocument {
        self.next_version += 1;
        doc.version = Some(self.next_version.to_string());
        let reap_at = doc
            .ttl
            .map(|secs| now + chrono::Duration::seconds(secs.max(0)));
        self.documents.insert(
            key.to_string(),
            StoredDocument {
                doc: doc.clone(),
                reap_at,
            },
        );
        doc
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<LeaseDocument>, StoreError> {
        let mut state = self.inner.lock();
        state.reap(Utc::now());
        Ok(state.documents.get(key).map(|stored| stored.doc.clone()))
    }

    async fn create(&self, doc: &LeaseDocument) -> Result<LeaseDocument, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        state.reap(now);
        if state.documents.contains_key(&doc.id) {
            return Err(StoreError::conflict(format!("document '{}' exists", doc.id)));
        }
        let key = doc.id.clone();
        Ok(state.store(&key, doc.clone(), now))
    }

    async fn replace(
        &self,
        key: &str,
        doc: &LeaseDocument,
        version: &str,
    ) -> Result<LeaseDocument, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        state.reap(now);
        let current = state
            .documents
            .get(key)
            .ok_or_else(|| StoreError::not_found(format!("no document '{key}'")))?;
        if current.doc.version.as_deref() != Some(version) {
            return Err(StoreError::precondition_failed("version token is stale"));
        }
        Ok(state.store(key, doc.clone(), now))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.reap(Utc::now());
        if state.documents.remove(key).is_none() {
            return Err(StoreError::not_found(format!("no document '{key}'")));
        }
        Ok(())
    }
}

// === impl InMemoryKvStore ===

impl InMemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(entries: &mut HashMap<String, KvEntry>, now: DateTime<Utc>) {
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| expiry_after(now, d)),
            },
        );
        Ok(true)
    }

    async fn extend_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, now);
        match entries.get_mut(key) {
            Some(entry) if entry.value == value => {
                entry.expires_at = ttl.map(|d| expiry_after(now, d));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Self::purge(&mut entries, now);
        match entries.get(key) {
            Some(entry) if entry.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
