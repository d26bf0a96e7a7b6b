//! Leadership lease: acquisition, expiry, loss and handover between workers.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cnc_conductor::clock::{Clock, ManualClock, SystemClock};
use cnc_conductor::config::{LeadershipConfig, MachineSpec, WorkerConfig};
use cnc_conductor::error::{ConductorError, StoreError};
use cnc_conductor::leadership::{LeadershipManager, LeadershipState};
use cnc_conductor::node::{Node, NodeParts};
use cnc_conductor::scheduler::NoopLedger;
use cnc_conductor::store::{LockRecord, LockStore, MemoryStore};
use test_harness::{wait_for, FakeBridge};

fn lease(ttl_secs: u64, heartbeat_secs: u64, retry_secs: u64) -> LeadershipConfig {
    LeadershipConfig {
        lock_name: "bg-worker".to_string(),
        ttl: Duration::from_secs(ttl_secs),
        heartbeat_interval: Duration::from_secs(heartbeat_secs),
        retry_interval: Duration::from_secs(retry_secs),
        max_renew_failures: 3,
    }
}

fn manager(
    owner: &str,
    config: LeadershipConfig,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
) -> LeadershipManager {
    LeadershipManager::new(owner, config, store, clock)
}

#[tokio::test]
async fn standby_acquires_after_leader_stops_heartbeating() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let p1 = manager("P1", lease(60, 20, 5), store.clone(), clock.clone());
    let p2 = manager("P2", lease(60, 20, 5), store.clone(), clock.clone());

    p1.try_acquire().await.unwrap();
    assert!(p1.is_leader());

    // P1 goes silent at t=0; P2 polls every 5s
    let mut acquired_at = None;
    for secs in (5..=90).step_by(5) {
        clock.set(start + chrono::Duration::seconds(secs));
        match p2.try_acquire().await {
            Ok(()) => {
                acquired_at = Some(secs);
                break;
            }
            Err(ConductorError::LockContention { holder, .. }) => {
                assert_eq!(holder.as_deref(), Some("P1"));
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    let acquired_at = acquired_at.expect("P2 never acquired the lease");
    assert!(acquired_at > 60 && acquired_at <= 65, "acquired at t={}s", acquired_at);

    let row = store.get_lock("bg-worker").await.unwrap().unwrap();
    assert_eq!(row.owner.as_deref(), Some("P2"));
}

#[tokio::test]
async fn concurrent_candidates_elect_exactly_one_leader() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut handles = Vec::new();
    for i in 0..8 {
        let m = manager(&format!("P{}", i), lease(60, 20, 5), store.clone(), clock.clone());
        handles.push(tokio::spawn(async move { m.try_acquire().await.is_ok() }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn released_lease_is_free_immediately() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let p1 = manager("P1", lease(60, 20, 5), store.clone(), clock.clone());
    let p2 = manager("P2", lease(60, 20, 5), store.clone(), clock);

    p1.try_acquire().await.unwrap();
    assert!(p2.try_acquire().await.is_err());

    p1.release().await.unwrap();
    assert_eq!(p1.state(), LeadershipState::Released);
    p2.try_acquire().await.unwrap();
    assert!(p2.is_leader());
}

#[tokio::test(start_paused = true)]
async fn lease_taken_over_is_lost_at_next_renewal() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let p1 = manager("P1", lease(60, 20, 5), store.clone(), clock.clone());
    let p2 = manager("P2", lease(60, 20, 5), store.clone(), clock.clone());

    p1.try_acquire().await.unwrap();
    // P1 was paused past its ttl and P2 took over in the meantime
    clock.advance(chrono::Duration::seconds(61));
    p2.try_acquire().await.unwrap();

    let res = p1.hold(&CancellationToken::new()).await;
    assert!(matches!(res, Err(ConductorError::LeadershipLost { .. })));
    assert!(matches!(p1.state(), LeadershipState::Lost { .. }));

    let row = store.get_lock("bg-worker").await.unwrap().unwrap();
    assert_eq!(row.owner.as_deref(), Some("P2"));
}

/// Lock store whose writes can be made to fail.
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockStore for FlakyStore {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.try_acquire(name, owner, now, expires_at).await
    }

    async fn renew(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.renew(name, owner, expires_at).await
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.release(name, owner).await
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        self.inner.get_lock(name).await
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_costs_leadership_after_threshold() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        down: AtomicBool::new(false),
    });
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let p1 = manager("P1", lease(60, 20, 5), store.clone(), clock);

    p1.try_acquire().await.unwrap();
    store.down.store(true, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    let res = p1.hold(&CancellationToken::new()).await;
    assert!(matches!(res, Err(ConductorError::LeadershipLost { .. })));
    // Three failed renewals, one heartbeat apart
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(80));
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_during_acquire_is_contention() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        down: AtomicBool::new(true),
    });
    let p1 = manager("P1", lease(60, 20, 5), store, Arc::new(SystemClock));

    let res = p1.try_acquire().await;
    assert!(matches!(
        res,
        Err(ConductorError::LockContention { holder: None, .. })
    ));
    assert!(!p1.is_leader());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let res = p1.wait_for_leadership(&cancel).await;
    assert!(matches!(res, Err(ConductorError::Shutdown)));
}

fn worker(id: &str, store: &Arc<MemoryStore>) -> (Node, mpsc::Receiver<cnc_conductor::bridge::CompletionEvent>) {
    let config = WorkerConfig::new(id)
        .with_leadership(LeadershipConfig {
            lock_name: "bg-worker".to_string(),
            ttl: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(200),
            retry_interval: Duration::from_millis(50),
            max_renew_failures: 3,
        })
        .with_machines(vec![MachineSpec {
            id: "M1".to_string(),
            diameter_group: Some("8".to_string()),
        }]);
    let (tx, rx) = mpsc::channel(16);
    let parts = NodeParts {
        lock_store: store.clone(),
        state_store: store.clone(),
        bridge: Arc::new(FakeBridge::new()),
        clock: Arc::new(SystemClock),
        ledger: Arc::new(NoopLedger),
        completions: tx,
    };
    (Node::with_parts(config, parts), rx)
}

#[tokio::test]
async fn graceful_shutdown_hands_leadership_to_standby() {
    let store = Arc::new(MemoryStore::new());

    let (p1, p1_rx) = worker("P1", &store);
    let p1_state = p1.leadership.subscribe();
    let p1_machines = p1.machines.clone();
    let p1_shutdown = CancellationToken::new();
    let p1_task = tokio::spawn(p1.run(p1_rx, p1_shutdown.clone()));

    assert!(
        wait_for(Duration::from_secs(2), || {
            let leader = p1_state.borrow().is_leader();
            async move { leader }
        })
        .await
    );
    // Takeover provisions configured machines
    assert!(
        wait_for(Duration::from_secs(2), || {
            let machines = p1_machines.clone();
            async move { machines.get("M1").await.is_ok() }
        })
        .await
    );

    let (p2, p2_rx) = worker("P2", &store);
    let p2_state = p2.leadership.subscribe();
    let p2_shutdown = CancellationToken::new();
    let p2_task = tokio::spawn(p2.run(p2_rx, p2_shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!p2_state.borrow().is_leader());

    p1_shutdown.cancel();
    p1_task.await.unwrap().unwrap();
    assert_eq!(*p1_state.borrow(), LeadershipState::Released);

    // Released lease is picked up well before the 2s ttl would run out
    assert!(
        wait_for(Duration::from_secs(1), || {
            let leader = p2_state.borrow().is_leader();
            async move { leader }
        })
        .await
    );
    let row = store.get_lock("bg-worker").await.unwrap().unwrap();
    assert_eq!(row.owner.as_deref(), Some("P2"));

    p2_shutdown.cancel();
    p2_task.await.unwrap().unwrap();
}

async fn race_acquire(candidates: &[Arc<LeadershipManager>]) -> Vec<String> {
    let mut attempts = tokio::task::JoinSet::new();
    for candidate in candidates {
        let candidate = candidate.clone();
        attempts.spawn(async move {
            candidate
                .try_acquire()
                .await
                .ok()
                .map(|()| candidate.owner().to_string())
        });
    }
    let mut winners = Vec::new();
    while let Some(res) = attempts.join_next().await {
        if let Some(owner) = res.unwrap() {
            winners.push(owner);
        }
    }
    winners
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_candidates_respect_the_expiry_boundary() {
    let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let p1 = manager("P1", lease(60, 20, 5), store.clone(), clock.clone());
    p1.try_acquire().await.unwrap();

    let candidates: Vec<Arc<LeadershipManager>> = (2..=6)
        .map(|n| {
            Arc::new(manager(
                &format!("P{}", n),
                lease(60, 20, 5),
                store.clone(),
                clock.clone(),
            ))
        })
        .collect();

    // One second before expiry the lease is still P1's
    clock.set(start + chrono::Duration::seconds(59));
    assert!(race_acquire(&candidates).await.is_empty());
    assert_eq!(
        store.get_lock("bg-worker").await.unwrap().unwrap().owner.as_deref(),
        Some("P1")
    );

    // Just past expiry exactly one candidate takes it
    clock.set(start + chrono::Duration::seconds(61));
    let winners = race_acquire(&candidates).await;
    assert_eq!(winners.len(), 1, "winners: {:?}", winners);
    let holder = store.get_lock("bg-worker").await.unwrap().unwrap();
    assert_eq!(holder.owner.as_deref(), Some(winners[0].as_str()));
    assert_eq!(candidates.iter().filter(|c| c.is_leader()).count(), 1);

    // The losers keep failing while the winner's fresh lease runs
    assert!(race_acquire(&candidates).await.is_empty());
}
