//! Chaos injection: a decorator that interposes on every lifecycle
//! operation of a wrapped backend.
//!
//! For each intercepted call the decorator builds a [`FaultContext`],
//! resolves the operation's settings, consults the decision policy, and
//! executes the fault it yields, if any. Delay faults run before
//! the real call; error and timeout faults replace it, and their errors
//! propagate out of the wrapped call unchanged, so injected renewal faults
//! flow into the auto-renewal engine's ordinary retry and loss rules.
//!
//! The decorated backend is indistinguishable from the wrapped one to every
//! layer above it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{AcquireRequest, Acquired, Backend, ResourceName};
use crate::Error;

pub mod fault;
mod observer;
pub mod policy;
mod validate;

pub use self::fault::{Fault, InjectedErrorKind, Severity};
pub use self::observer::{ChaosObserver, SkipReason};
pub use self::policy::Policy;
pub use self::validate::{validate, ValidationReport};

/// The lifecycle operations chaos can target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Backend acquisition.
    Acquire,

    /// Backend renewal.
    Renew,

    /// Backend release.
    Release,

    /// Administrative break.
    Break,
}

/// Everything a policy, fault, or observer learns about an intercepted
/// call.
#[derive(Clone, Debug)]
pub struct FaultContext {
    /// The intercepted operation.
    pub operation: Operation,

    /// The resource the operation targets, as the caller named it.
    pub resource_name: String,

    /// The lease id presented, for renew and release.
    pub lease_id: Option<String>,

    /// How many times this operation has been intercepted on this
    /// decorator, this call included.
    pub attempt_number: u64,

    /// The configured provider label.
    pub provider_name: String,

    /// The configured global metadata.
    pub metadata: HashMap<String, String>,

    /// The configured environment tags.
    pub environment_tags: Vec<String>,
}

/// An arbitrary predicate gating injection for one operation.
pub type ChaosCondition = Arc<dyn Fn(&FaultContext) -> bool + Send + Sync>;

/// Per-operation overrides; operation-level settings win over the global
/// defaults.
#[derive(Clone, Default)]
pub struct OperationChaos {
    /// Overrides the global kill-switch for this operation.
    pub enabled: Option<bool>,

    /// Overrides the default policy for this operation.
    pub policy: Option<Arc<Policy>>,

    /// Restricts injection to resources whose name matches one of these
    /// patterns (`*` wildcards). Empty matches everything.
    pub lease_name_patterns: Vec<String>,

    /// Additional caller-supplied gate, consulted after the name patterns.
    pub condition: Option<ChaosCondition>,
}

impl std::fmt::Debug for OperationChaos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationChaos")
            .field("enabled", &self.enabled)
            .field("policy", &self.policy)
            .field("lease_name_patterns", &self.lease_name_patterns)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Configuration for a [`ChaosBackend`].
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Global kill-switch.
    pub enabled: bool,

    /// Opaque label attached to every fault context, for telemetry.
    pub provider_name: String,

    /// Fallback policy for operations without their own.
    pub default_policy: Option<Arc<Policy>>,

    /// Operation-level overrides.
    pub per_operation: HashMap<Operation, OperationChaos>,

    /// Caps injected faults per sliding window; `None` is uncapped.
    pub max_fault_rate: Option<u32>,

    /// The sliding window for [`ChaosConfig::max_fault_rate`].
    pub rate_limit_window: Duration,

    /// Run the validator at construction and refuse configurations with
    /// errors.
    pub fail_fast_on_config_errors: bool,

    /// Attached to every fault context.
    pub global_metadata: HashMap<String, String>,

    /// Attached to every fault context.
    pub environment_tags: Vec<String>,
}

/// Wraps a backend and injects faults according to a [`ChaosConfig`].
pub struct ChaosBackend {
    inner: Arc<dyn Backend>,
    config: ChaosConfig,
    observer: Option<Arc<dyn ChaosObserver>>,
    attempts: OperationCounters,
    window: Mutex<VecDeque<Instant>>,
}

impl fmt::Debug for ChaosBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct OperationCounters {
    acquire: AtomicU64,
    renew: AtomicU64,
    release: AtomicU64,
    break_lease: AtomicU64,
}

// === impl Operation ===

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Acquire => f.write_str("acquire"),
            Operation::Renew => f.write_str("renew"),
            Operation::Release => f.write_str("release"),
            Operation::Break => f.write_str("break"),
        }
    }
}

// === impl ChaosConfig ===

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_name: "chaos".to_string(),
            default_policy: None,
            per_operation: HashMap::new(),
            max_fault_rate: None,
            rate_limit_window: Duration::from_secs(60),
            fail_fast_on_config_errors: true,
            global_metadata: HashMap::new(),
            environment_tags: Vec::new(),
        }
    }
}

impl ChaosConfig {
    /// A configuration that applies `policy` to every operation.
    pub fn with_default_policy(policy: Policy) -> Self {
        Self {
            default_policy: Some(Arc::new(policy)),
            ..Self::default()
        }
    }

    /// Applies `policy` to one operation only.
    pub fn for_operation(mut self, operation: Operation, policy: Policy) -> Self {
        let settings = self.per_operation.entry(operation).or_default();
        settings.policy = Some(Arc::new(policy));
        self
    }
}

// === impl ChaosBackend ===

impl ChaosBackend {
    /// Wraps a backend.
    ///
    /// Fails when `fail_fast_on_config_errors` is set and the validator
    /// finds errors.
    pub fn new(inner: Arc<dyn Backend>, config: ChaosConfig) -> Result<Self, Error> {
        Self::with_observer(inner, config, None)
    }

    /// Wraps a backend with an observer that receives decision and fault
    /// callbacks.
    pub fn with_observer(
        inner: Arc<dyn Backend>,
        config: ChaosConfig,
        observer: Option<Arc<dyn ChaosObserver>>,
    ) -> Result<Self, Error> {
        if config.fail_fast_on_config_errors {
            let report = validate(&config);
            if !report.is_ok() {
                return Err(Error::InvalidArgument(format!(
                    "chaos configuration rejected: {}",
                    report.errors.join("; "),
                )));
            }
        }
        Ok(Self {
            inner,
            config,
            observer,
            attempts: OperationCounters::default(),
            window: Mutex::new(VecDeque::new()),
        })
    }

    fn observe(&self, f: impl FnOnce(&dyn ChaosObserver)) {
        if let Some(observer) = &self.observer {
            // Observer panics must never disturb the decorated call.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&**observer)));
        }
    }

    fn context(
        &self,
        operation: Operation,
        resource: &ResourceName,
        lease_id: Option<&str>,
    ) -> FaultContext {
        let counter = match operation {
            Operation::Acquire => &self.attempts.acquire,
            Operation::Renew => &self.attempts.renew,
            Operation::Release => &self.attempts.release,
            Operation::Break => &self.attempts.break_lease,
        };
        FaultContext {
            operation,
            resource_name: resource.as_str().to_string(),
            lease_id: lease_id.map(str::to_string),
            attempt_number: counter.fetch_add(1, Ordering::Relaxed) + 1,
            provider_name: self.config.provider_name.clone(),
            metadata: self.config.global_metadata.clone(),
            environment_tags: self.config.environment_tags.clone(),
        }
    }

    fn admit_fault(&self, now: Instant) -> bool {
        let Some(max) = self.config.max_fault_rate else {
            return true;
        };
        let mut window = self.window.lock();
        while window
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.config.rate_limit_window)
        {
            window.pop_front();
        }
        if window.len() as u64 >= u64::from(max) {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Runs the chaos flow for one intercepted operation. `Ok(())` means
    /// the real call should proceed.
    async fn interpose(
        &self,
        operation: Operation,
        resource: &ResourceName,
        lease_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let context = self.context(operation, resource, lease_id);

        if !self.config.enabled {
            self.observe(|o| o.on_skip(&context, SkipReason::Disabled));
            return Ok(());
        }

        let settings = self.config.per_operation.get(&operation);
        if let Some(settings) = settings {
            if settings.enabled == Some(false) {
                self.observe(|o| o.on_skip(&context, SkipReason::Disabled));
                return Ok(());
            }
            if !settings.lease_name_patterns.is_empty()
                && !settings.lease_name_patterns.iter().any(|pattern| {
                    wildcard_match(pattern, resource.as_str()) || wildcard_match(pattern, resource.key())
                })
            {
                self.observe(|o| o.on_skip(&context, SkipReason::NameMismatch));
                return Ok(());
            }
            if let Some(condition) = &settings.condition {
                if !condition(&context) {
                    self.observe(|o| o.on_skip(&context, SkipReason::ConditionFailed));
                    return Ok(());
                }
            }
        }

        let policy = settings
            .and_then(|s| s.policy.clone())
            .or_else(|| self.config.default_policy.clone());
        let Some(policy) = policy else {
            self.observe(|o| o.on_skip(&context, SkipReason::NoPolicy));
            return Ok(());
        };

        let decision = policy.decide(&context);
        self.observe(|o| o.on_decision(&context, decision.as_ref().map(|f| f.name())));
        let Some(fault) = decision else {
            return Ok(());
        };

        if !self.admit_fault(Instant::now()) {
            self.observe(|o| o.on_skip(&context, SkipReason::RateLimited));
            return Ok(());
        }
        if !fault.can_execute(&context) {
            self.observe(|o| o.on_skip(&context, SkipReason::NotExecutable));
            return Ok(());
        }

        debug!(
            operation = %operation,
            resource = %resource,
            fault = fault.name(),
            severity = %fault.severity(),
            "injecting fault"
        );
        self.observe(|o| o.on_fault_start(&context, fault.name()));
        match fault.execute(&context, cancel).await {
            Ok(()) => {
                self.observe(|o| o.on_fault_complete(&context, fault.name()));
                Ok(())
            }
            Err(error) => {
                self.observe(|o| o.on_fault_error(&context, fault.name(), &error));
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl Backend for ChaosBackend {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquired>, Error> {
        self.interpose(Operation::Acquire, &request.resource, None, cancel)
            .await?;
        self.inner.acquire(request, cancel).await
    }

    async fn renew(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DateTime<Utc>, Error> {
        self.interpose(Operation::Renew, resource, Some(lease_id), cancel)
            .await?;
        self.inner.renew(resource, lease_id, duration, cancel).await
    }

    async fn release(
        &self,
        resource: &ResourceName,
        lease_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.interpose(Operation::Release, resource, Some(lease_id), cancel)
            .await?;
        self.inner.release(resource, lease_id, cancel).await
    }

    async fn break_lease(
        &self,
        resource: &ResourceName,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.interpose(Operation::Break, resource, None, cancel)
            .await?;
        self.inner.break_lease(resource, cancel).await
    }
}

/// Matches `text` against a pattern where `*` spans any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
