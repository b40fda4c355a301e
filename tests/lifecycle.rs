#![deny(warnings, rust_2018_idioms)]

//! End-to-end lifecycle behaviour over the in-process stores: basic
//! acquire/release, competition, idempotence, breaking, and the manager's
//! retry/timeout policy.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use holdfast::backend::atomic_kv::AtomicKvBackend;
use holdfast::backend::document::DocumentCasBackend;
use holdfast::backend::memory::{InMemoryDocumentStore, InMemoryKvStore, InMemoryLeaseStore};
use holdfast::backend::server_lease::ServerLeaseBackend;
use holdfast::backend::Backend;
use holdfast::{Error, LeaseDuration, LeaseManager, LeaseState, ManagerOptions};

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

fn manual_manager(backend: Arc<dyn Backend>) -> LeaseManager {
    LeaseManager::with_options(
        backend,
        ManagerOptions {
            auto_renew: false,
            acquire_retry_interval: Duration::from_millis(20),
            ..Default::default()
        },
    )
}

fn backends() -> Vec<(&'static str, Arc<dyn Backend>)> {
    vec![
        (
            "server-lease",
            Arc::new(ServerLeaseBackend::new(InMemoryLeaseStore::new())),
        ),
        (
            "document-cas",
            Arc::new(DocumentCasBackend::new(InMemoryDocumentStore::new())),
        ),
        (
            "atomic-kv",
            Arc::new(AtomicKvBackend::new(InMemoryKvStore::new())),
        ),
    ]
}

#[tokio::test]
async fn acquires_and_releases_every_backend() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();

    for (label, backend) in backends() {
        let manager = manual_manager(backend);
        let duration = LeaseDuration::Finite(Duration::from_secs(30));

        let lease = manager
            .try_acquire("res-a", Some(duration), &cancel)
            .await
            .unwrap_or_else(|e| panic!("{label}: acquire failed: {e}"))
            .unwrap_or_else(|| panic!("{label}: lease not granted"));

        assert!(lease.is_acquired(), "{label}");
        assert_eq!(lease.state(), LeaseState::Held, "{label}");
        assert!(!lease.lease_id().is_empty(), "{label}");
        let granted = (lease.expires_at().expect("finite") - lease.acquired_at())
            .to_std()
            .expect("positive");
        // The atomic-kv backend reports a drift-shortened validity.
        assert!(
            granted > Duration::from_secs(29) && granted <= Duration::from_secs(30),
            "{label}: granted {granted:?}"
        );

        // While held, a second actor is refused.
        assert!(
            manager
                .try_acquire("res-a", Some(duration), &cancel)
                .await
                .expect("try")
                .is_none(),
            "{label}: competition must see None"
        );

        // After release the resource is immediately free.
        lease.release(&cancel).await;
        assert_eq!(lease.state(), LeaseState::Released, "{label}");
        assert!(!lease.is_acquired(), "{label}");
        assert!(
            manager
                .try_acquire("res-a", Some(duration), &cancel)
                .await
                .expect("try")
                .is_some(),
            "{label}: resource must be free after release"
        );
    }
}

#[tokio::test]
async fn competition_grants_exactly_one() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryDocumentStore::new();
    let a = manual_manager(Arc::new(DocumentCasBackend::new(store.clone())));
    let b = manual_manager(Arc::new(DocumentCasBackend::new(store)));

    let duration = Some(LeaseDuration::Finite(Duration::from_secs(30)));
    let (first, second) = tokio::join!(
        a.try_acquire("res-b", duration, &cancel),
        b.try_acquire("res-b", duration, &cancel),
    );
    let first = first.expect("no error on either side");
    let second = second.expect("no error on either side");

    assert_eq!(
        first.is_some() as u8 + second.is_some() as u8,
        1,
        "exactly one concurrent acquirer may win"
    );
}

#[tokio::test]
async fn release_is_idempotent() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let manager = manual_manager(Arc::new(DocumentCasBackend::new(InMemoryDocumentStore::new())));

    let lease = manager
        .try_acquire("res-c", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    lease.release(&cancel).await;
    lease.release(&cancel).await;
    lease.release(&cancel).await;
    assert_eq!(lease.state(), LeaseState::Released);

    // Renewing a released handle reports disposal.
    let err = lease.renew(&cancel).await.expect_err("released");
    assert!(matches!(err, Error::Disposed), "{err}");
}

#[tokio::test]
async fn break_frees_the_resource_for_another_actor() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryKvStore::new();
    let holder = manual_manager(Arc::new(AtomicKvBackend::new(store.clone())));
    let admin = manual_manager(Arc::new(AtomicKvBackend::new(store)));

    let lease = holder
        .try_acquire("res-d", Some(LeaseDuration::Finite(Duration::from_secs(30))), &cancel)
        .await
        .expect("acquire")
        .expect("held");
    assert!(lease.is_acquired());

    admin.break_lease("res-d", &cancel).await.expect("break");
    let taken = admin
        .try_acquire("res-d", None, &cancel)
        .await
        .expect("acquire after break")
        .expect("must succeed regardless of prior ownership");
    assert!(taken.is_acquired());
}

#[tokio::test]
async fn names_normalise_to_one_key() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryDocumentStore::new();
    let manager = manual_manager(Arc::new(DocumentCasBackend::new(store)));

    let lease = manager
        .try_acquire("Payments EU", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    assert_eq!(lease.resource().key(), "payments-eu");

    // A different spelling of the same key is the same resource.
    assert!(
        manager
            .try_acquire("payments eu", None, &cancel)
            .await
            .expect("try")
            .is_none(),
        "normalised spellings must collide"
    );
}

#[tokio::test]
async fn owner_tag_is_recorded() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let manager = LeaseManager::with_options(
        Arc::new(DocumentCasBackend::new(InMemoryDocumentStore::new())),
        ManagerOptions {
            auto_renew: false,
            owner_tag: Some("host-1".to_string()),
            ..Default::default()
        },
    );

    let lease = manager
        .try_acquire("res-e", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    assert_eq!(lease.owner_tag(), Some("host-1"));
}

#[tokio::test]
async fn blocking_acquire_waits_for_the_holder() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryKvStore::new();
    let holder = manual_manager(Arc::new(AtomicKvBackend::new(store.clone())));
    let waiter = manual_manager(Arc::new(AtomicKvBackend::new(store)));

    let duration = Some(LeaseDuration::Finite(Duration::from_secs(30)));
    let lease = holder
        .try_acquire("res-f", duration, &cancel)
        .await
        .expect("acquire")
        .expect("held");

    let waited = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            waiter
                .acquire("res-f", duration, Some(Duration::from_secs(5)), &cancel)
                .await
        }
    });

    time::sleep(Duration::from_millis(60)).await;
    lease.release(&cancel).await;

    let granted = waited.await.expect("join").expect("acquired after release");
    assert!(granted.is_acquired());
}

#[tokio::test]
async fn zero_timeout_makes_exactly_one_attempt() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryKvStore::new();
    let holder = manual_manager(Arc::new(AtomicKvBackend::new(store.clone())));
    let waiter = manual_manager(Arc::new(AtomicKvBackend::new(store)));

    let _lease = holder
        .try_acquire("res-g", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");

    let started = time::Instant::now();
    let err = waiter
        .acquire("res-g", None, Some(Duration::ZERO), &cancel)
        .await
        .expect_err("must time out");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "zero budget must not sleep"
    );
    match err {
        Error::Acquisition(message) => {
            assert!(message.contains("timed out after 0ms"), "{message}");
            assert!(message.contains("res-g"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_interrupts_the_acquire_retry_sleep() {
    let _guard = init_tracing();
    let store = InMemoryKvStore::new();
    let holder = manual_manager(Arc::new(AtomicKvBackend::new(store.clone())));
    let waiter = LeaseManager::with_options(
        Arc::new(AtomicKvBackend::new(store)),
        ManagerOptions {
            auto_renew: false,
            // Long enough that only cancellation can end the sleep promptly.
            acquire_retry_interval: Duration::from_secs(60),
            ..Default::default()
        },
    );

    let root = CancellationToken::new();
    let _lease = holder
        .try_acquire("res-h", None, &root)
        .await
        .expect("acquire")
        .expect("held");

    let cancel = root.child_token();
    let waiting = tokio::spawn(async move { waiter.acquire("res-h", None, None, &cancel).await });

    time::sleep(Duration::from_millis(50)).await;
    root.cancel();

    let err = time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("cancellation must interrupt the sleep")
        .expect("join")
        .expect_err("canceled");
    assert!(matches!(err, Error::Canceled), "{err}");
}

#[tokio::test]
async fn dropping_a_handle_releases_the_claim() {
    let _guard = init_tracing();
    let cancel = CancellationToken::new();
    let store = InMemoryDocumentStore::new();
    let manager = manual_manager(Arc::new(DocumentCasBackend::new(store)));

    {
        let _lease = manager
            .try_acquire("res-i", None, &cancel)
            .await
            .expect("acquire")
            .expect("held");
        // Dropped here without an explicit release.
    }

    // The scoped release runs on the runtime; give it a moment.
    let mut freed = false;
    for _ in 0..50 {
        time::sleep(Duration::from_millis(10)).await;
        if let Some(lease) = manager
            .try_acquire("res-i", None, &cancel)
            .await
            .expect("try")
        {
            lease.release(&cancel).await;
            freed = true;
            break;
        }
    }
    assert!(freed, "dropping the handle must release the claim");
}
