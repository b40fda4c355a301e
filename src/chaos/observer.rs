//! Observer hooks for the chaos decorator.

use super::FaultContext;
use crate::Error;

/// Why an intercepted operation passed through without a fault.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Chaos is disabled globally or for this operation.
    Disabled,

    /// No policy is configured for this operation.
    NoPolicy,

    /// The resource name matched none of the configured patterns.
    NameMismatch,

    /// The operation's caller-supplied condition declined.
    ConditionFailed,

    /// The sliding-window fault-rate cap was reached.
    RateLimited,

    /// The selected fault reported it cannot run for this context.
    NotExecutable,
}

/// Receives callbacks around every chaos decision and fault execution.
///
/// All methods default to no-ops; implement the ones of interest. Panics
/// raised by an observer are caught and suppressed so they can never
/// disturb the decorated operation.
pub trait ChaosObserver: Send + Sync {
    /// The policy was consulted; `fault` names the chosen strategy, or is
    /// `None` when the policy declined.
    fn on_decision(&self, _context: &FaultContext, _fault: Option<&str>) {}

    /// A fault is about to execute.
    fn on_fault_start(&self, _context: &FaultContext, _fault: &str) {}

    /// A fault executed and the decorated call will proceed.
    fn on_fault_complete(&self, _context: &FaultContext, _fault: &str) {}

    /// A fault replaced the decorated call with an error.
    fn on_fault_error(&self, _context: &FaultContext, _fault: &str, _error: &Error) {}

    /// The operation passed through without consulting a fault.
    fn on_skip(&self, _context: &FaultContext, _reason: SkipReason) {}
}
