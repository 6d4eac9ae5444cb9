//! Several coordinators sharing one store, each with its own change notifier, standing in
//! for several server processes sharing one database.

use admin_nonce::store::{MemoryNonceStore, NonceStore};
use admin_nonce::{ChangeNotifier, LockCoordinator, WalletAddress};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SHORT: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(10);
const RESUBSCRIBE: Duration = Duration::from_millis(10);

struct Process {
    coordinator: LockCoordinator,
    notifier: ChangeNotifier,
}

impl Process {
    fn start(store: &MemoryNonceStore) -> Self {
        let coordinator = LockCoordinator::new(store.clone());
        let notifier = ChangeNotifier::spawn(
            store.clone(),
            coordinator.clone(),
            RESUBSCRIBE,
            CancellationToken::new(),
        );
        Self {
            coordinator,
            notifier,
        }
    }
}

fn address(s: &str) -> WalletAddress {
    s.parse().unwrap()
}

async fn wait_until_queued(coordinator: &LockCoordinator, n: usize) {
    tokio::time::timeout(LONG, async {
        while coordinator.queued().await != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue never reached expected length");
}

#[tokio::test]
async fn second_process_waits_for_first_to_finish() {
    let store = MemoryNonceStore::new();
    let first = Process::start(&store);
    let second = Process::start(&store);
    let a = address("0x1111111111111111111111111111111111111111");

    let lease = first.coordinator.acquire(&a, 100).await.unwrap();
    assert_eq!(lease.nonce(), 100);

    let mut waiting = tokio::spawn({
        let coordinator = second.coordinator.clone();
        let a = a.clone();
        async move { coordinator.acquire(&a, 0).await }
    });
    wait_until_queued(&second.coordinator, 1).await;
    assert!(tokio::time::timeout(SHORT, &mut waiting).await.is_err());

    // Only the store's unlock feed can tell the second process about this.
    lease.commit().await.unwrap();
    let lease = tokio::time::timeout(LONG, waiting)
        .await
        .expect("second process was never woken")
        .unwrap()
        .unwrap();
    assert_eq!(lease.nonce(), 101);
    lease.abort().await.unwrap();

    let record = store.get(&a).await.unwrap().unwrap();
    assert_eq!(record.nonce, 101);
    assert!(!record.locked);

    first.notifier.shutdown().await;
    second.notifier.shutdown().await;
}

#[tokio::test]
async fn remote_holder_blocks_the_whole_local_queue() {
    let store = MemoryNonceStore::new();
    let local = Process::start(&store);
    let remote = Process::start(&store);
    let a = address("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    let b = address("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    let remote_lease = remote.coordinator.acquire(&a, 0).await.unwrap();

    let mut for_a = tokio::spawn({
        let coordinator = local.coordinator.clone();
        let a = a.clone();
        async move { coordinator.acquire(&a, 0).await }
    });
    wait_until_queued(&local.coordinator, 1).await;
    let mut for_b = tokio::spawn({
        let coordinator = local.coordinator.clone();
        let b = b.clone();
        async move { coordinator.acquire(&b, 0).await }
    });
    wait_until_queued(&local.coordinator, 2).await;
    assert!(tokio::time::timeout(SHORT, &mut for_b).await.is_err());
    assert!(tokio::time::timeout(SHORT, &mut for_a).await.is_err());

    remote_lease.commit().await.unwrap();
    let lease_a = tokio::time::timeout(LONG, for_a).await.unwrap().unwrap().unwrap();
    assert_eq!(lease_a.nonce(), 1);

    lease_a.commit().await.unwrap();
    let lease_b = tokio::time::timeout(LONG, for_b).await.unwrap().unwrap().unwrap();
    assert_eq!(lease_b.nonce(), 0);
    lease_b.commit().await.unwrap();

    local.notifier.shutdown().await;
    remote.notifier.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processes_hand_out_gapless_unique_nonces() {
    const PROCESSES: usize = 3;
    const REQUESTS_PER_PROCESS: usize = 10;

    let store = MemoryNonceStore::new();
    let processes: Vec<_> = (0..PROCESSES).map(|_| Process::start(&store)).collect();
    let a = address("0x1111111111111111111111111111111111111111");
    let held = Arc::new(AtomicBool::new(false));

    let mut tasks = Vec::new();
    for process in &processes {
        for i in 0..REQUESTS_PER_PROCESS {
            let coordinator = process.coordinator.clone();
            let a = a.clone();
            let held = Arc::clone(&held);
            tasks.push(tokio::spawn(async move {
                let lease = coordinator.acquire(&a, 0).await.unwrap();
                assert!(
                    !held.swap(true, Ordering::SeqCst),
                    "two holders at once for one address"
                );
                let nonce = lease.nonce();
                tokio::time::sleep(Duration::from_millis(1)).await;
                held.store(false, Ordering::SeqCst);
                if i % 3 == 2 {
                    lease.abort().await.unwrap();
                    None
                } else {
                    lease.commit().await.unwrap();
                    Some(nonce)
                }
            }));
        }
    }

    let mut committed = Vec::new();
    for task in tasks {
        let outcome = tokio::time::timeout(LONG, task)
            .await
            .expect("a request never got its nonce")
            .unwrap();
        committed.extend(outcome);
    }

    let unique: HashSet<_> = committed.iter().copied().collect();
    assert_eq!(unique.len(), committed.len(), "a nonce was committed twice");
    committed.sort_unstable();
    let expected: Vec<u64> = (0..committed.len() as u64).collect();
    assert_eq!(committed, expected);

    let record = store.get(&a).await.unwrap().unwrap();
    assert_eq!(record.nonce, committed.len() as u64);
    assert!(!record.locked);

    for process in processes {
        process.notifier.shutdown().await;
    }
}
