#![deny(warnings, rust_2018_idioms)]

//! The process-wide active-lease gauge. Kept in its own binary so no
//! concurrent test can move the counter mid-assertion.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use holdfast::backend::atomic_kv::AtomicKvBackend;
use holdfast::backend::memory::InMemoryKvStore;
use holdfast::{active_leases, LeaseManager, ManagerOptions};

#[tokio::test]
async fn gauge_tracks_held_leases() {
    let cancel = CancellationToken::new();
    let manager = LeaseManager::with_options(
        Arc::new(AtomicKvBackend::new(InMemoryKvStore::new())),
        ManagerOptions {
            auto_renew: false,
            ..Default::default()
        },
    );

    let before = active_leases();

    let first = manager
        .try_acquire("res-gauge-1", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    let second = manager
        .try_acquire("res-gauge-2", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    assert_eq!(active_leases(), before + 2);

    // Losing the second handle decrements exactly once.
    manager
        .break_lease("res-gauge-2", &cancel)
        .await
        .expect("break");
    let rival = manager
        .try_acquire("res-gauge-2", None, &cancel)
        .await
        .expect("acquire")
        .expect("held");
    assert_eq!(active_leases(), before + 3);
    second.renew(&cancel).await.expect_err("ownership is gone");
    assert_eq!(active_leases(), before + 2);

    first.release(&cancel).await;
    rival.release(&cancel).await;
    assert_eq!(active_leases(), before);

    // Releasing again never double-decrements.
    first.release(&cancel).await;
    second.release(&cancel).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(active_leases(), before);
}
