//! Leader election across several candidates sharing one lease.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use function_controller::leader_election::{
    LeaderCallbacks, LeaderElectionConfig, LeaderElector, MemoryLeaseStore,
};

const LEASE: Duration = Duration::from_secs(60);
const RENEW: Duration = Duration::from_secs(15);
const RETRY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Shared {
    active: AtomicUsize,
    max_active: AtomicUsize,
    terms: Mutex<Vec<(String, Instant)>>,
}

struct Candidate {
    identity: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl LeaderCallbacks for Candidate {
    async fn on_started_leading(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active.fetch_max(active, Ordering::SeqCst);
        self.shared
            .terms
            .lock()
            .unwrap()
            .push((self.identity.clone(), Instant::now()));

        cancel.cancelled().await;
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Replica {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

fn spawn_replica(
    identity: &str,
    store: &MemoryLeaseStore,
    shared: &Arc<Shared>,
    release_on_cancel: bool,
) -> Replica {
    let config = LeaderElectionConfig::new(
        "useless".to_string(),
        "useless-controller".to_string(),
        identity.to_string(),
    )
    .with_lease_duration(LEASE)
    .with_renew_deadline(RENEW)
    .with_retry_period(RETRY)
    .with_release_on_cancel(release_on_cancel);

    let elector = LeaderElector::new(config, Arc::new(store.client(identity)));
    let callbacks = Arc::new(Candidate {
        identity: identity.to_string(),
        shared: Arc::clone(shared),
    });
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            elector.run(callbacks, cancel).await.unwrap();
        }
    });
    Replica { cancel, handle }
}

fn terms(shared: &Shared) -> Vec<(String, Instant)> {
    shared.terms.lock().unwrap().clone()
}

async fn wait_for_terms(shared: &Shared, count: usize) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while terms(shared).len() < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("leadership did not change in time");
}

async fn stop(replicas: Vec<Replica>) {
    for replica in &replicas {
        replica.cancel.cancel();
    }
    for replica in replicas {
        replica.handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_leader_among_racing_replicas() {
    let store = MemoryLeaseStore::new();
    let shared = Arc::new(Shared::default());
    let replicas: Vec<_> = (0..5)
        .map(|i| spawn_replica(&format!("replica-{i}"), &store, &shared, true))
        .collect();

    wait_for_terms(&shared, 1).await;
    tokio::time::sleep(Duration::from_secs(300)).await;

    let terms = terms(&shared);
    assert_eq!(terms.len(), 1);
    assert_eq!(store.holder().as_deref(), Some(terms[0].0.as_str()));
    assert_eq!(shared.max_active.load(Ordering::SeqCst), 1);

    stop(replicas).await;
    assert_eq!(shared.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_standby_takes_over_after_holder_stops_renewing() {
    let store = MemoryLeaseStore::new();
    let shared = Arc::new(Shared::default());
    let replicas: Vec<_> = (0..3)
        .map(|i| spawn_replica(&format!("replica-{i}"), &store, &shared, true))
        .collect();

    wait_for_terms(&shared, 1).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    let first = terms(&shared)[0].0.clone();

    store.partition(&first, true);
    let cut = Instant::now();

    wait_for_terms(&shared, 2).await;
    let (second, acquired_at) = terms(&shared)[1].clone();

    assert_ne!(second, first);
    assert!(acquired_at.duration_since(cut) <= LEASE + RETRY);
    // The partitioned holder had stepped down before anyone else took over.
    assert_eq!(shared.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(store.holder(), Some(second));

    stop(replicas).await;
}

#[tokio::test(start_paused = true)]
async fn test_released_lease_is_taken_over_quickly() {
    let store = MemoryLeaseStore::new();
    let shared = Arc::new(Shared::default());

    let leader = spawn_replica("a", &store, &shared, true);
    wait_for_terms(&shared, 1).await;
    let standby = spawn_replica("b", &store, &shared, true);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(store.holder().as_deref(), Some("a"));

    leader.cancel.cancel();
    leader.handle.await.unwrap();
    let released = Instant::now();

    wait_for_terms(&shared, 2).await;
    let (second, acquired_at) = terms(&shared)[1].clone();
    assert_eq!(second, "b");
    assert!(acquired_at.duration_since(released) <= RETRY);

    stop(vec![standby]).await;
}

#[tokio::test(start_paused = true)]
async fn test_unreleased_lease_waits_for_expiry() {
    let store = MemoryLeaseStore::new();
    let shared = Arc::new(Shared::default());

    let leader = spawn_replica("a", &store, &shared, false);
    wait_for_terms(&shared, 1).await;
    let standby = spawn_replica("b", &store, &shared, false);
    tokio::time::sleep(Duration::from_secs(20)).await;

    leader.cancel.cancel();
    leader.handle.await.unwrap();
    let stopped = Instant::now();
    assert_eq!(store.holder().as_deref(), Some("a"));

    wait_for_terms(&shared, 2).await;
    let (second, acquired_at) = terms(&shared)[1].clone();
    assert_eq!(second, "b");
    let waited = acquired_at.duration_since(stopped);
    assert!(waited >= LEASE - RETRY);
    assert!(waited <= LEASE + RETRY);

    stop(vec![standby]).await;
}

#[tokio::test(start_paused = true)]
async fn test_takeover_bound_holds_wherever_the_renewal_cycle_is_cut() {
    for offset_ms in [0, 1000, 2500, 4900, 7300] {
        let store = MemoryLeaseStore::new();
        let shared = Arc::new(Shared::default());
        let replicas: Vec<_> = (0..2)
            .map(|i| spawn_replica(&format!("replica-{i}"), &store, &shared, true))
            .collect();

        wait_for_terms(&shared, 1).await;
        tokio::time::sleep(Duration::from_secs(20) + Duration::from_millis(offset_ms)).await;
        let first = terms(&shared)[0].0.clone();

        store.partition(&first, true);
        let cut = Instant::now();

        wait_for_terms(&shared, 2).await;
        let (second, acquired_at) = terms(&shared)[1].clone();
        assert_ne!(second, first);
        let waited = acquired_at.duration_since(cut);
        assert!(
            waited <= LEASE + RETRY,
            "offset {offset_ms}ms: takeover after {waited:?}"
        );

        stop(replicas).await;
    }
}
