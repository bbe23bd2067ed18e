//! Pokes that arrive while a reconcile is in flight collapse into a single
//! follow-up pull.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mapsync_collab::{
    Authority, LoopbackRemote, NetworkError, Persistence, PokeStream, PushAck, Remote,
    SyncClient, SyncConfig, SyncStatus,
};
use mapsync_core::{
    Feature, FeatureCollectionDocument, Geometry, Mutation, WrappedFeatureCollectionId,
};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Loopback remote whose pulls can be held at a gate.
struct GatedRemote {
    inner: LoopbackRemote,
    pulls: AtomicU64,
    armed: AtomicBool,
    release: Notify,
}

impl GatedRemote {
    fn new(authority: Arc<Authority>) -> Self {
        Self {
            inner: LoopbackRemote::new(authority),
            pulls: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remote for GatedRemote {
    fn client_id(&self) -> Uuid {
        self.inner.client_id()
    }

    async fn pull(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, NetworkError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.armed.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.inner.pull(id).await
    }

    async fn push(
        &self,
        id: &WrappedFeatureCollectionId,
        mutations: Vec<Mutation>,
    ) -> Result<PushAck, NetworkError> {
        self.inner.push(id, mutations).await
    }

    async fn subscribe_pokes(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<PokeStream, NetworkError> {
        self.inner.subscribe_pokes(id).await
    }
}

fn doc_id() -> WrappedFeatureCollectionId {
    WrappedFeatureCollectionId::parse("coalesce").unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn push_from_elsewhere(authority: &Authority, other: Uuid, feature_id: &str) {
    let feature = Feature::new(feature_id, Geometry::Point([1.0, 1.0]));
    authority
        .push(&doc_id(), other, vec![Mutation::create(feature)])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pokes_during_reconcile_cause_exactly_one_pull() {
    let authority = Arc::new(Authority::in_memory());
    let remote = Arc::new(GatedRemote::new(authority.clone()));
    let client = SyncClient::new(remote.clone(), SyncConfig::for_testing());
    let other = Uuid::new_v4();

    let _snapshots = client.subscribe(&doc_id()).await;
    timeout(Duration::from_secs(3), async {
        while client.status(&doc_id()).await != Some(SyncStatus::Synced) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(remote.pulls(), 1);

    // First poke starts a reconcile whose pull is held at the gate.
    remote.arm();
    push_from_elsewhere(&authority, other, "f0").await;
    wait_until(|| remote.pulls() == 2).await;

    for i in 1..=5 {
        push_from_elsewhere(&authority, other, &format!("f{i}")).await;
    }
    // Let the poke listener drain all five pokes into the wake flag.
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.open_gate();

    // The held pull completes, then exactly one more pull follows.
    wait_until(|| remote.pulls() == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.pulls(), 3);

    let snapshot = client.snapshot(&doc_id()).await.unwrap();
    assert_eq!(snapshot.len(), 6);
    assert_eq!(snapshot.version, 6);
    assert_eq!(client.status(&doc_id()).await, Some(SyncStatus::Synced));
}

#[tokio::test]
async fn test_each_idle_poke_pulls() {
    let authority = Arc::new(Authority::in_memory());
    let remote = Arc::new(GatedRemote::new(authority.clone()));
    let client = SyncClient::new(remote.clone(), SyncConfig::for_testing());
    let other = Uuid::new_v4();

    let _snapshots = client.subscribe(&doc_id()).await;
    wait_until(|| remote.pulls() == 1).await;

    for i in 0..3 {
        push_from_elsewhere(&authority, other, &format!("g{i}")).await;
        wait_until(|| remote.pulls() == 2 + i).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.snapshot(&doc_id()).await.unwrap().len(), 3);
}
