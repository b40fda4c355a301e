//! The lease handle.
//!
//! A [`Lease`] is the per-acquisition object: it carries the identity minted
//! by the backend, tracks the `Held`/`Released`/`Lost` state machine, and
//! owns the auto-renewal engine when one is configured. Handles are safe to
//! share across tasks; renew and release serialise through one internal
//! mutex so manual and automatic renewals can never overlap a release.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Acquired, Backend, ResourceName};
use crate::Error;

static ACTIVE_LEASES: AtomicI64 = AtomicI64::new(0);

/// The number of leases this process currently holds, across all managers.
pub fn active_leases() -> i64 {
    ACTIVE_LEASES.load(Ordering::Relaxed)
}

/// Where a handle is in its life.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// The claim is live (or within its term, pending renewal).
    Held,

    /// The holder gave the claim up. Terminal.
    Released,

    /// Ownership was lost: renewal exhausted its retries, the safety
    /// threshold forbade another attempt, or the store reported an
    /// ownership mismatch. Terminal.
    Lost,
}

/// Notifications published by a handle.
///
/// Events are broadcast; subscribers that lag or disappear never affect the
/// renewal engine.
#[derive(Clone, Debug)]
pub enum LeaseEvent {
    /// A renewal succeeded.
    Renewed {
        /// The new expiry.
        expires_at: DateTime<Utc>,

        /// Time since the previous successful renewal (or the acquisition).
        elapsed: Duration,
    },

    /// A renewal attempt failed.
    RenewalFailed {
        /// 1-based attempt number within the current renewal cycle.
        attempt: u32,

        /// The failure, rendered for display.
        error: String,

        /// Whether the engine will try again before giving up.
        will_retry: bool,
    },

    /// Ownership was definitively lost. Fired at most once per handle,
    /// after the handle has already been marked terminal.
    Lost {
        /// Why the lease was lost.
        reason: String,

        /// The last successful renewal, if there was one.
        last_good_renewal: Option<DateTime<Utc>>,
    },
}

/// An exclusive, time-bounded claim on a named resource.
///
/// Dropping a handle stops its renewal engine and releases the claim on a
/// best-effort basis; call [`Lease::release`] to release deterministically.
pub struct Lease {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    backend: Arc<dyn Backend>,
    resource: ResourceName,
    lease_id: String,
    owner_tag: Option<String>,
    duration: Option<Duration>,
    acquired_at: DateTime<Utc>,

    /// Serialises every store call made on behalf of this handle.
    op: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<State>,
    events: broadcast::Sender<LeaseEvent>,

    /// Cancelled on release, loss, or drop; stops the renewal engine.
    cancel: CancellationToken,
}

struct State {
    status: LeaseState,
    expires_at: Option<DateTime<Utc>>,
    renewal_count: u64,
    last_renewed_at: Option<DateTime<Utc>>,

    /// Wall-clock start of the current term, for event timing.
    term_started_at: DateTime<Utc>,

    /// Monotonic start of the current term, for the safety-window guard.
    term_started: tokio::time::Instant,
}

// === impl LeaseState ===

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Held => f.write_str("held"),
            LeaseState::Released => f.write_str("released"),
            LeaseState::Lost => f.write_str("lost"),
        }
    }
}

// === impl Lease ===

impl Lease {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        acquired: Acquired,
        renewal: Option<crate::renewal::Plan>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            backend,
            resource: acquired.resource,
            lease_id: acquired.lease_id,
            owner_tag: acquired.owner_tag,
            duration: acquired.duration,
            acquired_at: acquired.acquired_at,
            op: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(State {
                status: LeaseState::Held,
                expires_at: acquired.expires_at,
                renewal_count: 0,
                last_renewed_at: None,
                term_started_at: acquired.acquired_at,
                term_started: tokio::time::Instant::now(),
            }),
            events,
            cancel: CancellationToken::new(),
        });
        ACTIVE_LEASES.fetch_add(1, Ordering::Relaxed);

        if let Some(plan) = renewal {
            crate::renewal::spawn(shared.clone(), plan);
        }

        Self { shared }
    }

    /// The resource this lease claims.
    pub fn resource(&self) -> &ResourceName {
        &self.shared.resource
    }

    /// The ownership token minted at acquisition.
    ///
    /// Callers that want fencing can present this to the protected resource.
    pub fn lease_id(&self) -> &str {
        &self.shared.lease_id
    }

    /// The owner tag recorded at acquisition, if any.
    pub fn owner_tag(&self) -> Option<&str> {
        self.shared.owner_tag.as_deref()
    }

    /// The nominal lease duration; `None` for infinite leases.
    pub fn duration(&self) -> Option<Duration> {
        self.shared.duration
    }

    /// When the claim took effect.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.shared.acquired_at
    }

    /// When the claim lapses unless renewed; `None` for infinite leases.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().expires_at
    }

    /// Successful renewals so far.
    pub fn renewal_count(&self) -> u64 {
        self.shared.state.lock().renewal_count
    }

    /// The handle's position in its lifecycle.
    pub fn state(&self) -> LeaseState {
        self.shared.state.lock().status
    }

    /// True while the claim is live: not released, not lost, and not past
    /// its expiry.
    pub fn is_acquired(&self) -> bool {
        let state = self.shared.state.lock();
        state.status == LeaseState::Held && state.expires_at.map_or(true, |at| Utc::now() < at)
    }

    /// Time left before expiry; `None` for infinite leases.
    pub fn remaining(&self) -> Option<Duration> {
        let expires_at = self.shared.state.lock().expires_at?;
        Some((expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Subscribes to this handle's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.shared.events.subscribe()
    }

    /// Waits until no more than `grace` remains before the expiry known at
    /// the time of the call. Never completes for an infinite lease.
    pub async fn until_expiry(&self, grace: Duration) {
        match self.expires_at() {
            None => std::future::pending().await,
            Some(expires_at) => {
                if let Ok(remaining) = (expires_at - Utc::now()).to_std() {
                    let sleep = remaining.saturating_sub(grace);
                    if !sleep.is_zero() {
                        tokio::time::sleep(sleep).await;
                    }
                }
            }
        }
    }

    /// Extends the lease by its nominal duration.
    ///
    /// Renewing an infinite lease is a successful no-op. A store-reported
    /// ownership mismatch marks the handle lost (and fires the lost event)
    /// before the error is returned.
    pub async fn renew(&self, cancel: &CancellationToken) -> Result<(), Error> {
        match self.shared.renew_once(cancel).await {
            Ok(_) => Ok(()),
            Err(Error::Lost(reason)) => {
                self.shared.lose(&reason);
                Err(Error::Lost(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Releases the claim.
    ///
    /// Idempotent: only the first call on a held handle contacts the store,
    /// and store failures are swallowed (the lease expires naturally).
    /// Releasing a lost handle is a silent no-op.
    pub async fn release(&self, cancel: &CancellationToken) {
        self.shared.release(cancel).await
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Lease")
            .field("resource", &self.shared.resource.as_str())
            .field("lease_id", &self.shared.lease_id)
            .field("state", &state.status)
            .field("expires_at", &state.expires_at)
            .field("renewal_count", &state.renewal_count)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if self.shared.state.lock().status != LeaseState::Held {
            return;
        }

        // Scoped release: hand the store call to the runtime if there is
        // one; otherwise the lease is left to expire.
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let shared = self.shared.clone();
                let _task = rt.spawn(async move {
                    shared.release(&CancellationToken::new()).await;
                });
            }
            Err(_) => {
                warn!(
                    resource = %self.shared.resource,
                    "lease handle dropped outside a runtime; leaving the lease to expire"
                );
                if self.shared.transition_from_held(LeaseState::Released) {
                    ACTIVE_LEASES.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }
}

// === impl Shared ===

impl Shared {
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn term_started(&self) -> tokio::time::Instant {
        self.state.lock().term_started
    }

    fn transition_from_held(&self, to: LeaseState) -> bool {
        let mut state = self.state.lock();
        if state.status != LeaseState::Held {
            return false;
        }
        state.status = to;
        true
    }

    fn emit(&self, event: LeaseEvent) {
        // Absent or lagging subscribers are fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_renewal_failed(&self, attempt: u32, error: &Error, will_retry: bool) {
        self.emit(LeaseEvent::RenewalFailed {
            attempt,
            error: error.to_string(),
            will_retry,
        });
    }

    /// Marks the handle lost and fires the lost event. Idempotent; the
    /// terminal transition happens before the event so that a release
    /// triggered by a subscriber is a no-op.
    pub(crate) fn lose(&self, reason: &str) {
        if !self.transition_from_held(LeaseState::Lost) {
            return;
        }
        ACTIVE_LEASES.fetch_sub(1, Ordering::Relaxed);
        self.cancel.cancel();
        let last_good_renewal = self.state.lock().last_renewed_at;
        warn!(resource = %self.resource, reason, "lease lost");
        self.emit(LeaseEvent::Lost {
            reason: reason.to_string(),
            last_good_renewal,
        });
    }

    /// Performs one serialised renewal against the store, updating the
    /// handle's bookkeeping and firing the renewed event on success.
    ///
    /// Returns `Ok(None)` for infinite leases (nothing to extend). Does not
    /// transition the handle on [`Error::Lost`]; callers decide how to
    /// sequence the loss against their own events.
    pub(crate) async fn renew_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let _op = self.op.lock().await;

        match self.state.lock().status {
            LeaseState::Held => {}
            LeaseState::Lost => {
                return Err(Error::Lost(format!(
                    "lease on '{}' was already lost",
                    self.resource
                )))
            }
            LeaseState::Released => return Err(Error::Disposed),
        }

        let Some(duration) = self.duration else {
            return Ok(None);
        };

        let new_expiry = self
            .backend
            .renew(&self.resource, &self.lease_id, duration, cancel)
            .await?;

        let now = Utc::now();
        let elapsed = {
            let mut state = self.state.lock();
            let elapsed = (now - state.term_started_at).to_std().unwrap_or_default();
            // Expiry never moves backwards.
            state.expires_at = Some(state.expires_at.map_or(new_expiry, |cur| cur.max(new_expiry)));
            state.renewal_count += 1;
            state.last_renewed_at = Some(now);
            state.term_started_at = now;
            state.term_started = tokio::time::Instant::now();
            elapsed
        };
        debug!(resource = %self.resource, %new_expiry, "lease renewed");
        self.emit(LeaseEvent::Renewed {
            expires_at: new_expiry,
            elapsed,
        });
        Ok(Some(new_expiry))
    }

    async fn release(&self, cancel: &CancellationToken) {
        // Stop the engine without waiting for it, so that a release issued
        // from inside an event callback cannot deadlock.
        self.cancel.cancel();

        let _op = self.op.lock().await;
        if !self.transition_from_held(LeaseState::Released) {
            return;
        }
        ACTIVE_LEASES.fetch_sub(1, Ordering::Relaxed);

        if let Err(error) = self
            .backend
            .release(&self.resource, &self.lease_id, cancel)
            .await
        {
            // The lease expires naturally.
            debug!(resource = %self.resource, %error, "suppressed release failure");
        }
    }
}
