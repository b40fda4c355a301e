//! Fault strategies: the *what* of an injected fault.
//!
//! Faults are tagged variants rather than open trait objects so that a
//! configuration can be validated completely at construction time.

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{FaultContext, ValidationReport};
use crate::Error;

/// How disruptive a fault is, for observers and logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Slows an operation down without failing it.
    Low,

    /// May fail individual operations.
    Medium,

    /// Fails operations outright.
    High,

    /// May cost the holder its lease.
    Critical,
}

/// The taxonomy kind an injected failure surfaces as.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InjectedErrorKind {
    /// Competition: recovered locally by the acquire retry loop.
    Conflict,

    /// The store looks unreachable.
    Unavailable,

    /// A retriable renewal failure.
    Renewal,

    /// An unexpected acquisition failure.
    Acquisition,

    /// Definitive loss of ownership.
    Lost,
}

/// A named fault with a severity and a behaviour.
#[derive(Clone, Debug)]
pub struct Fault {
    name: String,
    severity: Severity,
    kind: FaultKind,
}

#[derive(Clone, Debug)]
enum FaultKind {
    /// Sleeps before letting the real call proceed.
    Delay { min: Duration, max: Duration },

    /// Replaces the call with a constructed error.
    Error {
        kind: InjectedErrorKind,
        message: String,
    },

    /// Waits, then raises a cancellation-style error.
    Timeout { wait: Duration },

    /// Applies an inner fault on a repeating pattern.
    Intermittent {
        pattern: Arc<Vec<bool>>,
        cursor: Arc<AtomicUsize>,
        inner: Box<Fault>,
    },
}

// === impl Severity ===

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => f.write_str("low"),
            Severity::Medium => f.write_str("medium"),
            Severity::High => f.write_str("high"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

// === impl InjectedErrorKind ===

impl InjectedErrorKind {
    fn build(self, message: &str) -> Error {
        match self {
            InjectedErrorKind::Conflict => Error::Conflict,
            InjectedErrorKind::Unavailable => Error::Unavailable(message.to_string()),
            InjectedErrorKind::Renewal => Error::Renewal(message.to_string()),
            InjectedErrorKind::Acquisition => Error::Acquisition(message.to_string()),
            InjectedErrorKind::Lost => Error::Lost(message.to_string()),
        }
    }
}

// === impl Fault ===

impl Fault {
    /// A fixed delay before the real call.
    pub fn delay(duration: Duration) -> Self {
        Self::delay_between(duration, duration)
    }

    /// A uniformly random delay before the real call.
    pub fn delay_between(min: Duration, max: Duration) -> Self {
        Self {
            name: "delay".to_string(),
            severity: Severity::Low,
            kind: FaultKind::Delay { min, max },
        }
    }

    /// Replaces the call with an error of the given kind.
    pub fn error(kind: InjectedErrorKind, message: impl ToString) -> Self {
        Self {
            name: "error".to_string(),
            severity: match kind {
                InjectedErrorKind::Lost => Severity::Critical,
                _ => Severity::High,
            },
            kind: FaultKind::Error {
                kind,
                message: message.to_string(),
            },
        }
    }

    /// Waits the given duration, then raises a cancellation-style error.
    pub fn timeout(wait: Duration) -> Self {
        Self {
            name: "timeout".to_string(),
            severity: Severity::High,
            kind: FaultKind::Timeout { wait },
        }
    }

    /// Applies `inner` on a repeating boolean pattern; `false` positions
    /// let the call through untouched.
    pub fn intermittent(inner: Fault, pattern: Vec<bool>) -> Self {
        Self {
            name: format!("intermittent-{}", inner.name),
            severity: inner.severity,
            kind: FaultKind::Intermittent {
                pattern: Arc::new(pattern),
                cursor: Arc::new(AtomicUsize::new(0)),
                inner: Box::new(inner),
            },
        }
    }

    /// Renames the fault; names identify strategies in observer callbacks
    /// and must be unique within a policy.
    pub fn named(mut self, name: impl ToString) -> Self {
        self.name = name.to_string();
        self
    }

    /// The strategy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The strategy severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// A human-readable description of the behaviour.
    pub fn description(&self) -> String {
        match &self.kind {
            FaultKind::Delay { min, max } if min == max => {
                format!("delays the operation by {}ms", min.as_millis())
            }
            FaultKind::Delay { min, max } => format!(
                "delays the operation by {}..{}ms",
                min.as_millis(),
                max.as_millis()
            ),
            FaultKind::Error { kind, message } => {
                format!("fails the operation with {kind:?}: {message}")
            }
            FaultKind::Timeout { wait } => {
                format!("times the operation out after {}ms", wait.as_millis())
            }
            FaultKind::Intermittent { pattern, inner, .. } => format!(
                "applies '{}' on a {}-step pattern",
                inner.name,
                pattern.len()
            ),
        }
    }

    /// Whether the fault can run for the given context.
    pub fn can_execute(&self, context: &FaultContext) -> bool {
        match &self.kind {
            FaultKind::Delay { min, max } => min <= max,
            FaultKind::Error { .. } | FaultKind::Timeout { .. } => true,
            FaultKind::Intermittent { pattern, inner, .. } => {
                !pattern.is_empty() && inner.can_execute(context)
            }
        }
    }

    /// Resolves intermittent wrappers to the fault that should run now,
    /// advancing their pattern cursors. `None` means this evaluation sits
    /// on a pass-through position.
    fn effective(&self) -> Option<&Fault> {
        match &self.kind {
            FaultKind::Intermittent {
                pattern,
                cursor,
                inner,
            } => {
                if pattern.is_empty() {
                    return None;
                }
                let position = cursor.fetch_add(1, Ordering::Relaxed) % pattern.len();
                if pattern[position] {
                    inner.effective()
                } else {
                    None
                }
            }
            _ => Some(self),
        }
    }

    /// Runs the fault. `Ok(())` means the decorated call should proceed;
    /// an error replaces the call's outcome and propagates unchanged.
    pub(crate) async fn execute(
        &self,
        _context: &FaultContext,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let Some(fault) = self.effective() else {
            return Ok(());
        };
        match &fault.kind {
            FaultKind::Delay { min, max } => {
                let wait = if min == max {
                    *min
                } else {
                    rand::thread_rng().gen_range(*min..=*max)
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Canceled),
                    _ = tokio::time::sleep(wait) => Ok(()),
                }
            }
            FaultKind::Error { kind, message } => Err(kind.build(message)),
            FaultKind::Timeout { wait } => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(*wait) => {}
                }
                Err(Error::Canceled)
            }
            // `effective` never yields a wrapper.
            FaultKind::Intermittent { .. } => Ok(()),
        }
    }

    pub(crate) fn check(&self, scope: &str, report: &mut ValidationReport) {
        match &self.kind {
            FaultKind::Delay { min, max } => {
                if min > max {
                    report
                        .errors
                        .push(format!("{scope}: delay bounds are inverted"));
                }
            }
            FaultKind::Intermittent { pattern, inner, .. } => {
                if pattern.is_empty() {
                    report
                        .errors
                        .push(format!("{scope}: intermittent pattern is empty"));
                }
                inner.check(scope, report);
            }
            FaultKind::Error { .. } | FaultKind::Timeout { .. } => {}
        }
    }
}
