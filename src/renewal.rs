//! The background auto-renewal engine.
//!
//! One engine runs per handle, on its own task. Each cycle it sleeps until
//! the renewal interval elapses, refuses to run past the safety threshold,
//! and otherwise renews with bounded exponential retries whose delays are
//! clamped to the remaining safety window. Definitive loss of ownership
//! short-circuits the retries.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, trace};

use crate::lease::Shared;
use crate::Error;

/// The fraction of the lease duration past which renewal is refused.
pub const DEFAULT_SAFETY_THRESHOLD: f64 = 0.9;

/// Tuning for the auto-renewal engine.
///
/// The engine is configured per manager and validated against each lease's
/// duration at acquisition time.
#[derive(Clone, Debug)]
pub struct RenewalConfig {
    /// Time between renewal cycles. Defaults to two thirds of the lease
    /// duration. Must be shorter than both the duration and the safety
    /// window.
    pub interval: Option<Duration>,

    /// Fraction of the lease duration past which renewal is refused.
    /// Accepted range is `[0.5, 0.95]`.
    pub safety_threshold: f64,

    /// Retries after a failed renewal attempt; the engine makes at most
    /// `max_retries + 1` attempts per cycle.
    pub max_retries: u32,

    /// Base delay before the first retry; subsequent retries double it.
    /// Must not exceed the gap between the interval and the duration.
    pub retry_backoff: Duration,
}

/// A [`RenewalConfig`] resolved against a concrete lease duration.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Plan {
    pub(crate) interval: Duration,
    pub(crate) safety_window: Duration,
    pub(crate) max_retries: u32,
    pub(crate) backoff: Duration,
}

// === impl RenewalConfig ===

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            interval: None,
            safety_threshold: DEFAULT_SAFETY_THRESHOLD,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl RenewalConfig {
    /// Resolves this configuration against a lease duration, rejecting
    /// combinations that could schedule work past the safety window.
    pub(crate) fn plan(&self, duration: Duration) -> Result<Plan, Error> {
        if !(0.5..=0.95).contains(&self.safety_threshold) {
            return Err(Error::InvalidArgument(format!(
                "safety threshold must be within [0.5, 0.95], got {}",
                self.safety_threshold,
            )));
        }
        let safety_window = duration.mul_f64(self.safety_threshold);
        let interval = self.interval.unwrap_or(duration * 2 / 3);
        if interval >= duration {
            return Err(Error::InvalidArgument(format!(
                "renewal interval {}ms must be shorter than the lease duration {}ms",
                interval.as_millis(),
                duration.as_millis(),
            )));
        }
        if interval >= safety_window {
            return Err(Error::InvalidArgument(format!(
                "renewal interval {}ms must be shorter than the safety window {}ms",
                interval.as_millis(),
                safety_window.as_millis(),
            )));
        }
        if self.retry_backoff > duration - interval {
            return Err(Error::InvalidArgument(format!(
                "retry backoff {}ms must not exceed the {}ms between renewal and expiry",
                self.retry_backoff.as_millis(),
                (duration - interval).as_millis(),
            )));
        }
        Ok(Plan {
            interval,
            safety_window,
            max_retries: self.max_retries,
            backoff: self.retry_backoff,
        })
    }
}

// === engine ===

pub(crate) fn spawn(shared: Arc<Shared>, plan: Plan) {
    let _task = tokio::spawn(run(shared, plan));
}

async fn run(shared: Arc<Shared>, plan: Plan) {
    let cancel = shared.cancel_token().clone();
    let mut last_attempt = shared.term_started();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = time::sleep_until(last_attempt + plan.interval) => {}
        }

        // Manual renewals restart the term; measure the window from the
        // freshest term start.
        let term_started = shared.term_started();
        if term_started.elapsed() >= plan.safety_window {
            shared.lose("safety threshold exceeded");
            return;
        }

        let attempts = plan.max_retries.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            match shared.renew_once(&cancel).await {
                Ok(Some(_)) => {
                    trace!(attempt, "renewal cycle complete");
                    last_attempt = shared.term_started();
                    break;
                }
                // Infinite leases never start an engine.
                Ok(None) => return,
                // The handle was released out from under the engine.
                Err(Error::Disposed) => return,
                Err(Error::Canceled) if cancel.is_cancelled() => return,
                Err(Error::Lost(reason)) => {
                    shared.emit_renewal_failed(attempt, &Error::Lost(reason.clone()), false);
                    shared.lose(&reason);
                    return;
                }
                Err(error) => {
                    let will_retry = attempt < attempts;
                    shared.emit_renewal_failed(attempt, &error, will_retry);
                    if !will_retry {
                        shared.lose(&format!(
                            "renewal failed after {} retries: {error}",
                            plan.max_retries,
                        ));
                        return;
                    }

                    // Exponential backoff, clamped so no retry is scheduled
                    // past the safety window.
                    let exp = (attempt - 1).min(20);
                    let delay = plan
                        .backoff
                        .checked_mul(1 << exp)
                        .unwrap_or(Duration::MAX)
                        .min(plan.safety_window.saturating_sub(term_started.elapsed()));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying renewal");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
