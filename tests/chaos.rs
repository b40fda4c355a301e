#![deny(warnings, rust_2018_idioms)]

//! Chaos-layer behaviour seen through the public surface: deterministic
//! and threshold policies, observer callbacks, rate limiting, validation,
//! and fault propagation through the manager's retry loop.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use holdfast::backend::atomic_kv::AtomicKvBackend;
use holdfast::backend::memory::InMemoryKvStore;
use holdfast::backend::Backend;
use holdfast::chaos::{
    validate, ChaosBackend, ChaosConfig, ChaosObserver, Fault, FaultContext, InjectedErrorKind,
    Operation, OperationChaos, Policy, SkipReason,
};
use holdfast::{Error, LeaseManager, ManagerOptions};

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "holdfast=trace".parse().unwrap()),
            )
            .finish(),
    )
}

fn kv_backend() -> Arc<dyn Backend> {
    Arc::new(AtomicKvBackend::new(InMemoryKvStore::new()))
}

fn manager(backend: Arc<dyn Backend>) -> LeaseManager {
    LeaseManager::with_options(
        backend,
        ManagerOptions {
            auto_renew: false,
            acquire_retry_interval: Duration::from_millis(20),
            ..Default::default()
        },
    )
}

/// Records every callback it receives.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ChaosObserver for Recorder {
    fn on_decision(&self, context: &FaultContext, fault: Option<&str>) {
        self.calls.lock().push(format!(
            "decision:{}:{}",
            context.operation,
            fault.unwrap_or("none")
        ));
    }

    fn on_fault_start(&self, _context: &FaultContext, fault: &str) {
        self.calls.lock().push(format!("start:{fault}"));
    }

    fn on_fault_complete(&self, _context: &FaultContext, fault: &str) {
        self.calls.lock().push(format!("complete:{fault}"));
    }

    fn on_fault_error(&self, _context: &FaultContext, fault: &str, error: &Error) {
        self.calls.lock().push(format!("error:{fault}:{error}"));
    }

    fn on_skip(&self, _context: &FaultContext, reason: SkipReason) {
        self.calls.lock().push(format!("skip:{reason:?}"));
    }
}

#[tokio::test]
async fn acquire_retry_recovers_from_injected_conflicts() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    // The first three acquisition attempts throw competition errors.
    let observer = Arc::new(Recorder::default());
    let chaos = ChaosBackend::with_observer(
        kv_backend(),
        ChaosConfig::default().for_operation(
            Operation::Acquire,
            Policy::fail_first_n(3, Fault::error(InjectedErrorKind::Conflict, "injected")),
        ),
        Some(observer.clone()),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let started = time::Instant::now();
    let lease = manager
        .acquire("res-retry", None, None, &cancel)
        .await
        .expect("the fourth attempt must succeed");
    assert!(lease.is_acquired());
    assert!(
        started.elapsed() >= Duration::from_millis(60),
        "three retry sleeps must have elapsed"
    );

    let errors = observer
        .calls()
        .iter()
        .filter(|c| c.starts_with("error:"))
        .count();
    assert_eq!(errors, 3, "exactly three faults were injected");

    lease.release(&cancel).await;
}

#[tokio::test]
async fn threshold_delay_slows_only_the_first_cycles() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let chaos = ChaosBackend::new(
        kv_backend(),
        ChaosConfig::default().for_operation(
            Operation::Acquire,
            Policy::first_n(3, Fault::delay(Duration::from_millis(200))),
        ),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let mut latencies = Vec::new();
    for _ in 0..5 {
        let started = time::Instant::now();
        let lease = manager
            .try_acquire("res-slow", None, &cancel)
            .await
            .expect("acquire")
            .expect("held");
        latencies.push(started.elapsed());
        lease.release(&cancel).await;
    }

    for (i, latency) in latencies.iter().enumerate() {
        if i < 3 {
            assert!(
                *latency >= Duration::from_millis(190),
                "cycle {i} must be delayed, took {latency:?}"
            );
        } else {
            assert!(
                *latency < Duration::from_millis(100),
                "cycle {i} must not be delayed, took {latency:?}"
            );
        }
    }
}

#[tokio::test]
async fn observer_sees_the_whole_flow() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let observer = Arc::new(Recorder::default());
    let chaos = ChaosBackend::with_observer(
        kv_backend(),
        ChaosConfig::default().for_operation(
            Operation::Acquire,
            Policy::alternate(Fault::error(InjectedErrorKind::Unavailable, "injected")),
        ),
        Some(observer.clone()),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    // First attempt: the fault fires and surfaces.
    let err = manager
        .try_acquire("res-obs", None, &cancel)
        .await
        .expect_err("fault replaces the call");
    assert!(matches!(err, Error::Unavailable(_)), "{err}");

    // Second attempt: the policy declines and the call passes through.
    let lease = manager
        .try_acquire("res-obs", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    lease.release(&cancel).await;

    let calls = observer.calls();
    assert_eq!(calls[0], "decision:acquire:error");
    assert_eq!(calls[1], "start:error");
    assert!(calls[2].starts_with("error:error:"), "{}", calls[2]);
    assert_eq!(calls[3], "decision:acquire:none");
    // The release is not configured for chaos.
    assert_eq!(calls[4], "skip:NoPolicy");
}

#[tokio::test]
async fn panicking_observers_are_suppressed() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    struct Panicker;
    impl ChaosObserver for Panicker {
        fn on_decision(&self, _: &FaultContext, _: Option<&str>) {
            panic!("observer bug");
        }
    }

    let chaos = ChaosBackend::with_observer(
        kv_backend(),
        ChaosConfig::with_default_policy(Policy::probabilistic(
            0.0,
            Fault::error(InjectedErrorKind::Unavailable, "never"),
        )),
        Some(Arc::new(Panicker)),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let lease = manager
        .try_acquire("res-panic", None, &cancel)
        .await
        .expect("the observer panic must not disturb the call")
        .expect("held");
    lease.release(&cancel).await;
}

#[tokio::test]
async fn name_patterns_scope_the_faults() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let mut config = ChaosConfig::default();
    config.per_operation.insert(
        Operation::Acquire,
        OperationChaos {
            policy: Some(Arc::new(Policy::probabilistic(
                1.0,
                Fault::error(InjectedErrorKind::Unavailable, "injected"),
            ))),
            lease_name_patterns: vec!["orders-*".to_string()],
            ..Default::default()
        },
    );
    let chaos = ChaosBackend::new(kv_backend(), config).expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let err = manager
        .try_acquire("orders-eu", None, &cancel)
        .await
        .expect_err("matching names are faulted");
    assert!(matches!(err, Error::Unavailable(_)), "{err}");

    let lease = manager
        .try_acquire("billing-eu", None, &cancel)
        .await
        .expect("non-matching names pass through")
        .expect("held");
    lease.release(&cancel).await;
}

#[tokio::test]
async fn conditions_gate_injection() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let mut config = ChaosConfig::default();
    config.per_operation.insert(
        Operation::Acquire,
        OperationChaos {
            policy: Some(Arc::new(Policy::probabilistic(
                1.0,
                Fault::error(InjectedErrorKind::Unavailable, "injected"),
            ))),
            // Spare the first interception, fault the rest.
            condition: Some(Arc::new(|context: &FaultContext| context.attempt_number > 1)),
            ..Default::default()
        },
    );
    let chaos = ChaosBackend::new(kv_backend(), config).expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let lease = manager
        .try_acquire("res-cond", None, &cancel)
        .await
        .expect("the condition declines the first call")
        .expect("held");
    lease.release(&cancel).await;

    let err = manager
        .try_acquire("res-cond", None, &cancel)
        .await
        .expect_err("subsequent calls are faulted");
    assert!(matches!(err, Error::Unavailable(_)), "{err}");
}

#[tokio::test]
async fn fault_rate_is_capped_per_window() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let observer = Arc::new(Recorder::default());
    let config = ChaosConfig {
        max_fault_rate: Some(2),
        rate_limit_window: Duration::from_secs(60),
        ..ChaosConfig::default().for_operation(
            Operation::Acquire,
            Policy::probabilistic(1.0, Fault::error(InjectedErrorKind::Unavailable, "injected")),
        )
    };
    let chaos = ChaosBackend::with_observer(kv_backend(), config, Some(observer.clone()))
        .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    for _ in 0..2 {
        let err = manager
            .try_acquire("res-capped", None, &cancel)
            .await
            .expect_err("under the cap, faults fire");
        assert!(matches!(err, Error::Unavailable(_)), "{err}");
    }

    // The cap is reached; the third call passes through untouched.
    let lease = manager
        .try_acquire("res-capped", None, &cancel)
        .await
        .expect("rate-limited call proceeds")
        .expect("held");
    lease.release(&cancel).await;

    assert!(
        observer.calls().contains(&"skip:RateLimited".to_string()),
        "{:?}",
        observer.calls()
    );
}

#[tokio::test]
async fn disabled_chaos_passes_everything_through() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let config = ChaosConfig {
        enabled: false,
        ..ChaosConfig::with_default_policy(Policy::probabilistic(
            1.0,
            Fault::error(InjectedErrorKind::Unavailable, "injected"),
        ))
    };
    let report = validate(&config);
    assert!(report.is_ok());
    assert!(
        report.warnings.iter().any(|w| w.contains("disabled")),
        "{:?}",
        report.warnings
    );

    let chaos = ChaosBackend::new(kv_backend(), config).expect("warnings do not fail fast");
    let manager = manager(Arc::new(chaos));
    let lease = manager
        .try_acquire("res-off", None, &cancel)
        .await
        .expect("no fault can fire")
        .expect("held");
    lease.release(&cancel).await;
}

#[tokio::test]
async fn fail_fast_rejects_invalid_configurations() {
    let _guard = init_tracing();

    let config = ChaosConfig::with_default_policy(
        Policy::probabilistic(0.5, Fault::error(InjectedErrorKind::Unavailable, "x")).with_seed(-1),
    );
    let err = ChaosBackend::new(kv_backend(), config).expect_err("negative seed");
    match err {
        Error::InvalidArgument(message) => {
            assert!(message.contains("negative"), "{message}")
        }
        other => panic!("unexpected error: {other}"),
    }

    // Without fail-fast the same configuration constructs, and the report
    // carries the error.
    let config = ChaosConfig {
        fail_fast_on_config_errors: false,
        ..ChaosConfig::with_default_policy(
            Policy::probabilistic(0.5, Fault::error(InjectedErrorKind::Unavailable, "x"))
                .with_seed(-1),
        )
    };
    assert!(!validate(&config).is_ok());
    ChaosBackend::new(kv_backend(), config).expect("construction proceeds");
}

#[tokio::test]
async fn empty_configuration_warns() {
    let report = validate(&ChaosConfig::default());
    assert!(report.is_ok());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("no decision policies")),
        "{:?}",
        report.warnings
    );
}

#[tokio::test]
async fn injected_break_faults_propagate() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let chaos = ChaosBackend::new(
        kv_backend(),
        ChaosConfig::default().for_operation(
            Operation::Break,
            Policy::probabilistic(1.0, Fault::error(InjectedErrorKind::Unavailable, "injected")),
        ),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let err = manager
        .break_lease("res-brk", &cancel)
        .await
        .expect_err("the fault propagates unchanged");
    assert!(matches!(err, Error::Unavailable(_)), "{err}");
}

#[tokio::test]
async fn injected_release_faults_are_swallowed_by_the_handle() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    let chaos = ChaosBackend::new(
        kv_backend(),
        ChaosConfig::default().for_operation(
            Operation::Release,
            Policy::probabilistic(1.0, Fault::error(InjectedErrorKind::Unavailable, "injected")),
        ),
    )
    .expect("chaos config");
    let manager = manager(Arc::new(chaos));

    let lease = manager
        .try_acquire("res-rel", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");

    // The release path never surfaces store errors, injected or real.
    lease.release(&cancel).await;
    assert!(!lease.is_acquired());
}
