//! Fan-out of poke notifications to the subscribers of a document.
//!
//! One tokio broadcast channel per document. A poke carries only the id of
//! the client whose push caused it, so that client can skip its own pokes.
//! Pokes are coalescible: a subscriber that lags behind sees every dropped
//! poke reported as a single one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use mapsync_core::WrappedFeatureCollectionId;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring poke fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PokeStats {
    pub pokes_sent: u64,
    pub pokes_lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`PokeGroup::stats`].
struct AtomicPokeStats {
    pokes_sent: AtomicU64,
    pokes_lagged: AtomicU64,
    subscribers: AtomicUsize,
}

impl AtomicPokeStats {
    fn new() -> Self {
        Self {
            pokes_sent: AtomicU64::new(0),
            pokes_lagged: AtomicU64::new(0),
            subscribers: AtomicUsize::new(0),
        }
    }
}

/// The poke channel of a single document.
pub struct PokeGroup {
    sender: broadcast::Sender<Uuid>,
    capacity: usize,
    stats: Arc<AtomicPokeStats>,
}

impl PokeGroup {
    /// `capacity` bounds how many pokes a slow subscriber can fall behind
    /// before older ones are collapsed.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicPokeStats::new()),
        }
    }

    pub fn subscribe(&self, client_id: Uuid) -> PokeSubscription {
        self.stats.subscribers.fetch_add(1, Ordering::Relaxed);
        PokeSubscription {
            client_id,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Poke every subscriber except `origin`. Returns the number of live
    /// receivers, including `origin`'s own.
    pub fn poke(&self, origin: Uuid) -> usize {
        let count = self.sender.send(origin).unwrap_or(0);
        self.stats.pokes_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.stats.subscribers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PokeStats {
        PokeStats {
            pokes_sent: self.stats.pokes_sent.load(Ordering::Relaxed),
            pokes_lagged: self.stats.pokes_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A client's receiving end of a document's poke channel.
pub struct PokeSubscription {
    client_id: Uuid,
    receiver: broadcast::Receiver<Uuid>,
    stats: Arc<AtomicPokeStats>,
}

impl PokeSubscription {
    /// Wait for the next poke caused by another client.
    ///
    /// Returns `None` once the group is gone.
    pub async fn recv(&mut self) -> Option<()> {
        loop {
            match self.receiver.recv().await {
                Ok(origin) if origin == self.client_id => continue,
                Ok(_) => return Some(()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.pokes_lagged.fetch_add(n, Ordering::Relaxed);
                    debug!("poke subscriber {} lagged by {n}", self.client_id);
                    return Some(());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }
}

impl Drop for PokeSubscription {
    fn drop(&mut self) {
        self.stats.subscribers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Maps documents to their poke groups.
///
/// Groups are created on first subscription and removed once empty.
pub struct PokeHub {
    groups: Arc<RwLock<HashMap<WrappedFeatureCollectionId, Arc<PokeGroup>>>>,
    default_capacity: usize,
}

impl PokeHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for `doc_id`.
    pub async fn get_or_create(&self, doc_id: &WrappedFeatureCollectionId) -> Arc<PokeGroup> {
        // Fast path: read lock
        {
            let groups = self.groups.read().await;
            if let Some(group) = groups.get(doc_id) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write().await;
        groups
            .entry(doc_id.clone())
            .or_insert_with(|| Arc::new(PokeGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn subscribe(
        &self,
        doc_id: &WrappedFeatureCollectionId,
        client_id: Uuid,
    ) -> PokeSubscription {
        self.get_or_create(doc_id).await.subscribe(client_id)
    }

    /// Poke the subscribers of `doc_id` other than `origin`. Documents with
    /// no group have no subscribers, so nothing is sent.
    pub async fn poke(&self, doc_id: &WrappedFeatureCollectionId, origin: Uuid) -> usize {
        let group = self.groups.read().await.get(doc_id).cloned();
        match group {
            Some(group) => group.poke(origin),
            None => 0,
        }
    }

    /// Remove the group of `doc_id` if nobody is subscribed to it.
    pub async fn remove_if_empty(&self, doc_id: &WrappedFeatureCollectionId) -> bool {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(doc_id) {
            if group.subscriber_count() == 0 {
                groups.remove(doc_id);
                debug!("poke group for {doc_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn stats(&self, doc_id: &WrappedFeatureCollectionId) -> Option<PokeStats> {
        self.groups.read().await.get(doc_id).map(|g| g.stats())
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<WrappedFeatureCollectionId> {
        self.groups.read().await.keys().cloned().collect()
    }
}
