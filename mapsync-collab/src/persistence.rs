//! The persistence port.
//!
//! UI-facing code only ever talks to [`Persistence`]. The two backends,
//! [`LocalPersistence`] and [`SyncClient`](crate::client::SyncClient),
//! honour the same contract:
//!
//! - `subscribe` yields the current state first, then every later state;
//! - `mutate` applies locally and returns without touching the network;
//! - a mutation that fails validation emits nothing;
//! - after `close` the snapshot stream ends.
//!
//! Snapshot streams have latest-value semantics: a slow consumer sees the
//! newest state and may skip intermediate ones.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use log::debug;
use mapsync_core::{
    ApplyPolicy, ConflictError, FeatureCollectionDocument, Mutation, ValidationError,
    WrappedFeatureCollectionId,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

/// Immutable snapshot handed to subscribers.
pub type Snapshot = Arc<FeatureCollectionDocument>;

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Snapshot> + Send>>;

/// Per-document synchronisation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Subscribing,
    Synced,
    Reconciling,
    /// Retries exhausted; needs a manual retry.
    Error,
}

impl SyncStatus {
    /// Whether local state may still be ahead of or behind the authority.
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Subscribing | Self::Reconciling)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged {
        id: WrappedFeatureCollectionId,
        status: SyncStatus,
    },
    /// A pending mutation was dropped because it no longer applies.
    MutationRejected {
        id: WrappedFeatureCollectionId,
        error: ConflictError,
    },
    /// Remote state was merged into the local view.
    Reconciled {
        id: WrappedFeatureCollectionId,
        version: u64,
    },
}

/// Returned by a successful `mutate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationReceipt {
    pub mutation_id: Uuid,
    /// Mutations of this document not yet acknowledged by the authority.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("document {0} is closed")]
    DocumentClosed(WrappedFeatureCollectionId),
    #[error("document {id} has {limit} unacknowledged mutations")]
    QueueFull {
        id: WrappedFeatureCollectionId,
        limit: usize,
    },
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn subscribe(&self, id: &WrappedFeatureCollectionId) -> SnapshotStream;

    async fn mutate(
        &self,
        id: &WrappedFeatureCollectionId,
        mutation: Mutation,
    ) -> Result<MutationReceipt, PersistenceError>;

    async fn close(&self, id: &WrappedFeatureCollectionId);

    /// Latest snapshot, if the document is open.
    async fn snapshot(&self, id: &WrappedFeatureCollectionId) -> Option<Snapshot>;

    async fn status(&self, id: &WrappedFeatureCollectionId) -> Option<SyncStatus>;

    fn events(&self) -> broadcast::Receiver<SyncEvent>;
}

/// Wrap a watch receiver as a snapshot stream. The current value is
/// yielded first; the stream ends when the sender is dropped.
pub(crate) fn snapshot_stream(rx: watch::Receiver<Snapshot>) -> SnapshotStream {
    Box::pin(WatchStream::new(rx))
}

/// In-memory backend with no remote. Every mutation is final as soon as it
/// is applied, so documents are always `Synced` with nothing pending.
pub struct LocalPersistence {
    documents: Mutex<HashMap<WrappedFeatureCollectionId, watch::Sender<Snapshot>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl LocalPersistence {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            documents: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn open<'a>(
        &self,
        documents: &'a mut HashMap<WrappedFeatureCollectionId, watch::Sender<Snapshot>>,
        id: &WrappedFeatureCollectionId,
    ) -> &'a watch::Sender<Snapshot> {
        documents.entry(id.clone()).or_insert_with(|| {
            debug!("opening local document {id}");
            let _ = self.events.send(SyncEvent::StatusChanged {
                id: id.clone(),
                status: SyncStatus::Synced,
            });
            let (tx, _) = watch::channel(Arc::new(FeatureCollectionDocument::empty(id.clone())));
            tx
        })
    }
}

impl Default for LocalPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for LocalPersistence {
    async fn subscribe(&self, id: &WrappedFeatureCollectionId) -> SnapshotStream {
        let mut documents = self.documents.lock().await;
        snapshot_stream(self.open(&mut documents, id).subscribe())
    }

    async fn mutate(
        &self,
        id: &WrappedFeatureCollectionId,
        mutation: Mutation,
    ) -> Result<MutationReceipt, PersistenceError> {
        let mut documents = self.documents.lock().await;
        let sender = self.open(&mut documents, id);

        let mut next = FeatureCollectionDocument::clone(&sender.borrow());
        next.apply(&mutation, ApplyPolicy::Strict)?;
        next.version += 1;
        sender.send_replace(Arc::new(next));

        Ok(MutationReceipt {
            mutation_id: mutation.id,
            pending: 0,
        })
    }

    async fn close(&self, id: &WrappedFeatureCollectionId) {
        if self.documents.lock().await.remove(id).is_some() {
            let _ = self.events.send(SyncEvent::StatusChanged {
                id: id.clone(),
                status: SyncStatus::Idle,
            });
        }
    }

    async fn snapshot(&self, id: &WrappedFeatureCollectionId) -> Option<Snapshot> {
        self.documents
            .lock()
            .await
            .get(id)
            .map(|tx| tx.borrow().clone())
    }

    async fn status(&self, id: &WrappedFeatureCollectionId) -> Option<SyncStatus> {
        self.documents
            .lock()
            .await
            .contains_key(id)
            .then_some(SyncStatus::Synced)
    }

    fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}
