//! Synced persistence backend.
//!
//! Each open document gets one driver task that owns all remote I/O for it:
//!
//! ```text
//!   Idle ──► Subscribing ──► Synced ◄──► Reconciling
//!                ▲   │          │
//!                │   ▼          ▼
//!                └─ Error ◄─────┘   (retries exhausted; manual retry)
//! ```
//!
//! `mutate` never waits on the network: it applies to the optimistic view,
//! appends to the pending queue and wakes the driver. The driver pushes
//! pending mutations in submission order, folds acknowledged ones into the
//! authoritative base, and on a poke pulls fresh state and replays whatever
//! is still pending on top of it.
//!
//! Pokes are coalesced through a single-permit [`Notify`], so any number of
//! pokes that arrive while a reconcile is in progress cause exactly one
//! further pull.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use log::{debug, info, warn};
use mapsync_core::{
    ApplyPolicy, ConflictError, FeatureCollectionDocument, Mutation, WrappedFeatureCollectionId,
};
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::persistence::{
    snapshot_stream, MutationReceipt, Persistence, PersistenceError, Snapshot, SnapshotStream,
    SyncEvent, SyncStatus,
};
use crate::protocol::{MutationStatus, PushAck};
use crate::remote::{NetworkError, PokeStream, Remote};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Attempts before giving up, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Unacknowledged mutations allowed per document
    pub max_pending: usize,
    /// Pull this often even without pokes
    pub fallback_pull_interval_ms: u64,
    pub retry: RetryPolicy,
    /// Buffer of the [`SyncEvent`] broadcast channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            fallback_pull_interval_ms: 30_000,
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            max_pending: 1_000,
            fallback_pull_interval_ms: 60_000,
            retry: RetryPolicy::for_testing(),
            event_capacity: 256,
        }
    }
}

struct DocState {
    /// Last state received from the authority
    base: FeatureCollectionDocument,
    /// Submitted locally, not yet acknowledged, in submission order
    pending: VecDeque<Mutation>,
    /// `base` with `pending` replayed on top; what subscribers see
    optimistic: Snapshot,
    status: SyncStatus,
    /// Taken on close, which ends every snapshot stream
    snapshots: Option<watch::Sender<Snapshot>>,
}

impl DocState {
    fn new(id: &WrappedFeatureCollectionId) -> Self {
        let base = FeatureCollectionDocument::empty(id.clone());
        let optimistic = Arc::new(base.clone());
        let (snapshots, _) = watch::channel(optimistic.clone());
        Self {
            base,
            pending: VecDeque::new(),
            optimistic,
            status: SyncStatus::Idle,
            snapshots: Some(snapshots),
        }
    }

    fn publish(&self) {
        if let Some(tx) = &self.snapshots {
            tx.send_replace(self.optimistic.clone());
        }
    }

    /// Replay pending mutations on `base`. Mutations that no longer apply
    /// are dropped and returned as conflicts.
    fn rebuild(&mut self) -> Vec<ConflictError> {
        let mut view = self.base.clone();
        let mut conflicts = Vec::new();
        self.pending
            .retain(|mutation| match view.apply(mutation, ApplyPolicy::Replay) {
                Ok(()) => true,
                Err(e) => {
                    conflicts.push(ConflictError::from_replay(mutation.id, e));
                    false
                }
            });
        self.optimistic = Arc::new(view);
        self.publish();
        conflicts
    }
}

struct DocShared {
    id: WrappedFeatureCollectionId,
    state: Mutex<DocState>,
    flush: Notify,
    poke: Notify,
    retry: Notify,
    events: broadcast::Sender<SyncEvent>,
}

impl DocShared {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Emitted under the state lock, so an observer that sees the new
    /// status can already receive its event.
    async fn set_status(&self, status: SyncStatus) {
        let mut state = self.state.lock().await;
        if state.status == status {
            return;
        }
        state.status = status;
        debug!("{}: {status:?}", self.id);
        self.emit(SyncEvent::StatusChanged {
            id: self.id.clone(),
            status,
        });
    }

    fn report_conflicts(&self, conflicts: Vec<ConflictError>) {
        for error in conflicts {
            warn!("{}: dropping pending mutation: {error}", self.id);
            self.emit(SyncEvent::MutationRejected {
                id: self.id.clone(),
                error,
            });
        }
    }

    /// Replace the base with freshly pulled state.
    async fn install_base(&self, doc: FeatureCollectionDocument) {
        let (conflicts, version) = {
            let mut state = self.state.lock().await;
            state.base = doc;
            (state.rebuild(), state.base.version)
        };
        self.report_conflicts(conflicts);
        self.emit(SyncEvent::Reconciled {
            id: self.id.clone(),
            version,
        });
    }

    /// Settle the first `sent` pending mutations against `ack`. Returns
    /// whether the base can no longer be advanced locally and a pull is
    /// needed.
    async fn apply_ack(&self, sent: usize, ack: &PushAck) -> bool {
        let mut conflicts = Vec::new();
        let need_pull = {
            let mut state = self.state.lock().await;
            let sent = sent.min(state.pending.len());
            let settled: Vec<Mutation> = state.pending.drain(..sent).collect();

            let mut need_pull = ack.base_version != state.base.version;
            let mut applied = Vec::new();
            for mutation in settled {
                match ack.status_of(mutation.id) {
                    Some(MutationStatus::Applied) => applied.push(mutation),
                    Some(MutationStatus::Rejected(reason)) => {
                        conflicts.push(ConflictError::RejectedByAuthority {
                            mutation_id: mutation.id,
                            reason: reason.clone(),
                        });
                    }
                    Some(MutationStatus::Duplicate) | None => need_pull = true,
                }
            }

            if !need_pull {
                let mut base = state.base.clone();
                need_pull = applied
                    .iter()
                    .any(|m| base.apply(m, ApplyPolicy::Authoritative).is_err());
                if !need_pull {
                    base.version = ack.version;
                    state.base = base;
                    conflicts.extend(state.rebuild());
                }
            }
            need_pull
        };
        self.report_conflicts(conflicts);
        need_pull
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Forwards a poke stream into the document's single-permit poke flag.
struct PokeListener {
    _task: AbortOnDrop,
    ended: oneshot::Receiver<()>,
}

impl PokeListener {
    fn spawn(mut pokes: PokeStream, shared: Arc<DocShared>) -> Self {
        let (tx, ended) = oneshot::channel();
        let task = tokio::spawn(async move {
            while pokes.next().await.is_some() {
                shared.poke.notify_one();
            }
            let _ = tx.send(());
        });
        Self {
            _task: AbortOnDrop(task),
            ended,
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    id: &WrappedFeatureCollectionId,
    what: &str,
    mut op: F,
) -> Result<T, NetworkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NetworkError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts.max(1) {
                    return Err(e);
                }
                let delay = policy.delay(attempt - 1);
                warn!("{id}: {what} failed ({e}), retry {attempt} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct Driver {
    shared: Arc<DocShared>,
    remote: Arc<dyn Remote>,
    config: SyncConfig,
}

impl Driver {
    async fn run(self) {
        let id = self.shared.id.clone();
        loop {
            self.shared.set_status(SyncStatus::Subscribing).await;
            let outcome = match self.connect().await {
                Ok(listener) => self.synced(listener).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    info!("{id}: poke subscription lost, resubscribing");
                    continue;
                }
                Err(e) => warn!("{id}: giving up after retries: {e}"),
            }

            self.shared.set_status(SyncStatus::Error).await;
            self.shared.retry.notified().await;
            info!("{id}: retrying");
        }
    }

    /// Open the poke subscription first, then pull, so no change made in
    /// between goes unnoticed.
    async fn connect(&self) -> Result<PokeListener, NetworkError> {
        let (id, remote) = (&self.shared.id, &self.remote);
        let retry = &self.config.retry;

        let pokes = with_retry(retry, id, "poke subscribe", || remote.subscribe_pokes(id)).await?;
        let listener = PokeListener::spawn(pokes, self.shared.clone());
        let doc = with_retry(retry, id, "pull", || remote.pull(id)).await?;
        debug!("{id}: subscribed at v{}", doc.version);
        self.shared.install_base(doc).await;
        Ok(listener)
    }

    /// Returns `Ok` when the poke stream ends, `Err` when retries ran out.
    async fn synced(&self, mut listener: PokeListener) -> Result<(), NetworkError> {
        self.shared.set_status(SyncStatus::Synced).await;

        let period = Duration::from_millis(self.config.fallback_pull_interval_ms.max(1));
        let mut fallback = interval_at(Instant::now() + period, period);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.flush().await?;
            tokio::select! {
                _ = self.shared.flush.notified() => {}
                _ = self.shared.poke.notified() => self.reconcile().await?,
                _ = fallback.tick() => {
                    debug!("{}: fallback pull", self.shared.id);
                    self.reconcile().await?;
                }
                _ = &mut listener.ended => return Ok(()),
            }
        }
    }

    async fn reconcile(&self) -> Result<(), NetworkError> {
        let (id, remote) = (&self.shared.id, &self.remote);
        self.shared.set_status(SyncStatus::Reconciling).await;
        let doc = with_retry(&self.config.retry, id, "pull", || remote.pull(id)).await?;
        self.shared.install_base(doc).await;
        self.shared.set_status(SyncStatus::Synced).await;
        Ok(())
    }

    /// Push everything pending, in submission order, until the queue is
    /// empty.
    async fn flush(&self) -> Result<(), NetworkError> {
        let (id, remote) = (&self.shared.id, &self.remote);
        loop {
            let batch: Vec<Mutation> = {
                let state = self.shared.state.lock().await;
                if state.pending.is_empty() {
                    return Ok(());
                }
                state.pending.iter().cloned().collect()
            };
            let sent = batch.len();

            let ack = with_retry(&self.config.retry, id, "push", || {
                remote.push(id, batch.clone())
            })
            .await?;
            debug!(
                "{id}: pushed {sent}, {} applied, v{} -> v{}",
                ack.applied(),
                ack.base_version,
                ack.version
            );

            if self.shared.apply_ack(sent, &ack).await {
                self.reconcile().await?;
            }
        }
    }
}

struct DocHandle {
    shared: Arc<DocShared>,
    _driver: AbortOnDrop,
}

/// [`Persistence`] backend that synchronises documents with an authority
/// through a [`Remote`].
pub struct SyncClient {
    remote: Arc<dyn Remote>,
    config: SyncConfig,
    documents: Mutex<HashMap<WrappedFeatureCollectionId, DocHandle>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(remote: Arc<dyn Remote>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            remote,
            config,
            documents: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.remote.client_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get the document's shared state, starting its driver on first use.
    async fn open(&self, id: &WrappedFeatureCollectionId) -> Arc<DocShared> {
        let mut documents = self.documents.lock().await;
        if let Some(handle) = documents.get(id) {
            return handle.shared.clone();
        }

        let shared = Arc::new(DocShared {
            id: id.clone(),
            state: Mutex::new(DocState::new(id)),
            flush: Notify::new(),
            poke: Notify::new(),
            retry: Notify::new(),
            events: self.events.clone(),
        });
        let driver = Driver {
            shared: shared.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
        };
        info!("opening {id}");
        let task = tokio::spawn(driver.run());
        documents.insert(
            id.clone(),
            DocHandle {
                shared: shared.clone(),
                _driver: AbortOnDrop(task),
            },
        );
        shared
    }

    async fn get(&self, id: &WrappedFeatureCollectionId) -> Option<Arc<DocShared>> {
        self.documents
            .lock()
            .await
            .get(id)
            .map(|handle| handle.shared.clone())
    }

    /// Leave the `Error` state and resubscribe. Returns `false` if the
    /// document is not open or not in `Error`.
    pub async fn retry(&self, id: &WrappedFeatureCollectionId) -> bool {
        let Some(shared) = self.get(id).await else {
            return false;
        };
        if shared.state.lock().await.status != SyncStatus::Error {
            return false;
        }
        shared.retry.notify_one();
        true
    }

    /// Number of mutations not yet acknowledged by the authority.
    pub async fn pending_count(&self, id: &WrappedFeatureCollectionId) -> Option<usize> {
        let shared = self.get(id).await?;
        let count = shared.state.lock().await.pending.len();
        Some(count)
    }

    /// Last authoritative state known for `id`, without pending mutations.
    pub async fn base(&self, id: &WrappedFeatureCollectionId) -> Option<FeatureCollectionDocument> {
        let shared = self.get(id).await?;
        let base = shared.state.lock().await.base.clone();
        Some(base)
    }
}

#[async_trait]
impl Persistence for SyncClient {
    async fn subscribe(&self, id: &WrappedFeatureCollectionId) -> SnapshotStream {
        let shared = self.open(id).await;
        let state = shared.state.lock().await;
        match &state.snapshots {
            Some(tx) => snapshot_stream(tx.subscribe()),
            None => Box::pin(stream::empty()),
        }
    }

    async fn mutate(
        &self,
        id: &WrappedFeatureCollectionId,
        mutation: Mutation,
    ) -> Result<MutationReceipt, PersistenceError> {
        let shared = self.open(id).await;
        let receipt = {
            let mut state = shared.state.lock().await;
            if state.snapshots.is_none() {
                return Err(PersistenceError::DocumentClosed(id.clone()));
            }
            if state.pending.len() >= self.config.max_pending {
                return Err(PersistenceError::QueueFull {
                    id: id.clone(),
                    limit: self.config.max_pending,
                });
            }

            let mut next = FeatureCollectionDocument::clone(&state.optimistic);
            next.apply(&mutation, ApplyPolicy::Strict)?;
            let mutation_id = mutation.id;
            state.pending.push_back(mutation);
            state.optimistic = Arc::new(next);
            state.publish();
            MutationReceipt {
                mutation_id,
                pending: state.pending.len(),
            }
        };
        shared.flush.notify_one();
        Ok(receipt)
    }

    async fn close(&self, id: &WrappedFeatureCollectionId) {
        let Some(handle) = self.documents.lock().await.remove(id) else {
            return;
        };
        handle.shared.state.lock().await.snapshots = None;
        // Dropping the handle aborts the driver; an in-flight push is
        // abandoned and its outcome discarded.
        drop(handle);
        info!("closed {id}");
        let _ = self.events.send(SyncEvent::StatusChanged {
            id: id.clone(),
            status: SyncStatus::Idle,
        });
    }

    async fn snapshot(&self, id: &WrappedFeatureCollectionId) -> Option<Snapshot> {
        let shared = self.get(id).await?;
        let snapshot = shared.state.lock().await.optimistic.clone();
        Some(snapshot)
    }

    async fn status(&self, id: &WrappedFeatureCollectionId) -> Option<SyncStatus> {
        let shared = self.get(id).await?;
        let status = shared.state.lock().await.status;
        Some(status)
    }

    fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
