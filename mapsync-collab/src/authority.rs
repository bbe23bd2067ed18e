//! The server of record.
//!
//! Keeps one authoritative [`FeatureCollectionDocument`] per id with a
//! linear version counter. Every applied mutation advances the version by
//! one. Pushes are idempotent per mutation id within a sliding window of
//! recently applied ids, so a client that retries after a lost ack gets
//! `Duplicate` instead of a second application.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use mapsync_core::{ApplyPolicy, FeatureCollectionDocument, Mutation, WrappedFeatureCollectionId};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::poke::{PokeHub, PokeSubscription};
use crate::protocol::{MutationOutcome, MutationStatus, PushAck};
use crate::storage::{DocumentStore, StoreError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Pokes buffered per subscriber before they are collapsed
    pub poke_capacity: usize,
    /// Number of recently applied mutation ids remembered per document
    pub dedup_window: usize,
    /// Compact the stored mutation log every N versions (0 disables)
    pub compact_every: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            poke_capacity: 64,
            dedup_window: 4096,
            compact_every: 1024,
        }
    }
}

impl AuthorityConfig {
    pub fn for_testing() -> Self {
        Self {
            poke_capacity: 16,
            dedup_window: 64,
            compact_every: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub pulls: u64,
    pub pushes: u64,
    pub mutations_applied: u64,
    pub mutations_duplicate: u64,
    pub mutations_rejected: u64,
    pub documents: usize,
}

#[derive(Default)]
struct AtomicAuthorityStats {
    pulls: AtomicU64,
    pushes: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_duplicate: AtomicU64,
    mutations_rejected: AtomicU64,
}

/// Recently applied mutation ids, oldest first.
struct AppliedWindow {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    limit: usize,
}

impl AppliedWindow {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.limit == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

struct DocumentState {
    doc: FeatureCollectionDocument,
    applied: AppliedWindow,
}

/// In-process authority, shared by the WebSocket server and loopback
/// remotes.
pub struct Authority {
    config: AuthorityConfig,
    documents: RwLock<HashMap<WrappedFeatureCollectionId, Arc<Mutex<DocumentState>>>>,
    hub: Arc<PokeHub>,
    store: Option<Arc<DocumentStore>>,
    stats: AtomicAuthorityStats,
}

impl Authority {
    pub fn new(config: AuthorityConfig, store: Option<Arc<DocumentStore>>) -> Self {
        let hub = Arc::new(PokeHub::new(config.poke_capacity));
        Self {
            config,
            documents: RwLock::new(HashMap::new()),
            hub,
            store,
            stats: AtomicAuthorityStats::default(),
        }
    }

    /// In-memory authority without persistence.
    pub fn in_memory() -> Self {
        Self::new(AuthorityConfig::default(), None)
    }

    /// Load every persisted document, so they are available before the
    /// first client connects.
    pub async fn recover(&self) -> Result<usize, AuthorityError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let ids = store.list_documents()?;
        let mut recovered = 0;
        for id in &ids {
            match self.load_state(store, id) {
                Ok(Some(state)) => {
                    self.documents
                        .write()
                        .await
                        .insert(id.clone(), Arc::new(Mutex::new(state)));
                    recovered += 1;
                    debug!("recovered document {id}");
                }
                Ok(None) => {}
                Err(e) => warn!("failed to recover document {id}: {e}"),
            }
        }

        info!("recovery complete: {recovered}/{} documents restored", ids.len());
        Ok(recovered)
    }

    fn load_state(
        &self,
        store: &DocumentStore,
        id: &WrappedFeatureCollectionId,
    ) -> Result<Option<DocumentState>, StoreError> {
        let doc = match store.load_document(id) {
            Ok(doc) => doc,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut applied = AppliedWindow::new(self.config.dedup_window);
        let since = doc.version.saturating_sub(self.config.dedup_window as u64);
        for (_, mutation) in store.load_mutations_since(id, since)? {
            applied.insert(mutation.id);
        }
        Ok(Some(DocumentState { doc, applied }))
    }

    /// Look up the state of `id`, loading it from the store if needed.
    /// With `create`, a missing document is created empty.
    async fn state(
        &self,
        id: &WrappedFeatureCollectionId,
        create: bool,
    ) -> Result<Option<Arc<Mutex<DocumentState>>>, AuthorityError> {
        if let Some(state) = self.documents.read().await.get(id) {
            return Ok(Some(state.clone()));
        }

        let mut documents = self.documents.write().await;
        if let Some(state) = documents.get(id) {
            return Ok(Some(state.clone()));
        }
        let loaded = match &self.store {
            Some(store) => self.load_state(store, id)?,
            None => None,
        };
        let state = match (loaded, create) {
            (Some(state), _) => state,
            (None, true) => DocumentState {
                doc: FeatureCollectionDocument::empty(id.clone()),
                applied: AppliedWindow::new(self.config.dedup_window),
            },
            (None, false) => return Ok(None),
        };
        let state = Arc::new(Mutex::new(state));
        documents.insert(id.clone(), state.clone());
        Ok(Some(state))
    }

    /// Current authoritative state. Unknown ids yield an empty version-0
    /// document.
    pub async fn pull(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, AuthorityError> {
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        match self.state(id, false).await? {
            Some(state) => Ok(state.lock().await.doc.clone()),
            None => Ok(FeatureCollectionDocument::empty(id.clone())),
        }
    }

    /// Apply `mutations` in order and poke the other subscribers if
    /// anything changed.
    pub async fn push(
        &self,
        id: &WrappedFeatureCollectionId,
        client_id: Uuid,
        mutations: Vec<Mutation>,
    ) -> Result<PushAck, AuthorityError> {
        self.stats.pushes.fetch_add(1, Ordering::Relaxed);
        let Some(state) = self.state(id, true).await? else {
            return Err(AuthorityError::Store(StoreError::NotFound(id.clone())));
        };

        let ack = {
            let mut state = state.lock().await;
            let base_version = state.doc.version;
            let mut next = state.doc.clone();
            let mut outcomes = Vec::with_capacity(mutations.len());
            let mut applied = Vec::new();

            for mutation in mutations {
                let status = if state.applied.contains(&mutation.id)
                    || applied.iter().any(|(_, m): &(u64, Mutation)| m.id == mutation.id)
                {
                    self.stats.mutations_duplicate.fetch_add(1, Ordering::Relaxed);
                    MutationStatus::Duplicate
                } else if let Err(e) = next.apply(&mutation, ApplyPolicy::Authoritative) {
                    self.stats.mutations_rejected.fetch_add(1, Ordering::Relaxed);
                    debug!("{id}: rejected {} {}: {e}", mutation.name(), mutation.id);
                    MutationStatus::Rejected(e.to_string())
                } else {
                    next.version += 1;
                    self.stats.mutations_applied.fetch_add(1, Ordering::Relaxed);
                    MutationStatus::Applied
                };
                outcomes.push(MutationOutcome {
                    mutation_id: mutation.id,
                    status: status.clone(),
                });
                if status == MutationStatus::Applied {
                    applied.push((next.version, mutation));
                }
            }

            if !applied.is_empty() {
                if let Some(store) = &self.store {
                    store.commit(&next, &applied)?;
                    self.maybe_compact(store, &next);
                }
                for (_, mutation) in &applied {
                    state.applied.insert(mutation.id);
                }
                state.doc = next;
            }

            PushAck {
                base_version,
                version: state.doc.version,
                outcomes,
            }
        };

        if ack.applied() > 0 {
            let poked = self.hub.poke(id, client_id).await;
            debug!(
                "{id}: v{} -> v{}, poked {poked} receiver(s)",
                ack.base_version, ack.version
            );
        }
        Ok(ack)
    }

    fn maybe_compact(&self, store: &DocumentStore, doc: &FeatureCollectionDocument) {
        let every = self.config.compact_every;
        if every == 0 || doc.version % every != 0 {
            return;
        }
        let keep_from = doc.version.saturating_sub(self.config.dedup_window as u64);
        if keep_from == 0 {
            return;
        }
        match store.compact_mutations(&doc.id, keep_from - 1) {
            Ok(removed) => debug!("{}: compacted {removed} logged mutation(s)", doc.id),
            Err(e) => warn!("{}: mutation log compaction failed: {e}", doc.id),
        }
    }

    pub async fn subscribe(&self, id: &WrappedFeatureCollectionId, client_id: Uuid) -> PokeSubscription {
        self.hub.subscribe(id, client_id).await
    }

    pub fn hub(&self) -> &Arc<PokeHub> {
        &self.hub
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    pub async fn stats(&self) -> AuthorityStats {
        AuthorityStats {
            pulls: self.stats.pulls.load(Ordering::Relaxed),
            pushes: self.stats.pushes.load(Ordering::Relaxed),
            mutations_applied: self.stats.mutations_applied.load(Ordering::Relaxed),
            mutations_duplicate: self.stats.mutations_duplicate.load(Ordering::Relaxed),
            mutations_rejected: self.stats.mutations_rejected.load(Ordering::Relaxed),
            documents: self.documents.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use mapsync_core::{Feature, Geometry};
    use tokio::time::{timeout, Duration};

    fn doc_id() -> WrappedFeatureCollectionId {
        WrappedFeatureCollectionId::parse("parcels").unwrap()
    }

    fn point(id: &str) -> Feature {
        Feature::new(id, Geometry::Point([0.0, 0.0]))
    }

    #[tokio::test]
    async fn test_pull_unknown_is_empty() {
        let authority = Authority::in_memory();
        let doc = authority.pull(&doc_id()).await.unwrap();
        assert_eq!(doc.version, 0);
        assert!(doc.is_empty());
        assert_eq!(authority.stats().await.documents, 0);
    }

    #[tokio::test]
    async fn test_push_applies_and_versions() {
        let authority = Authority::in_memory();
        let client = Uuid::new_v4();
        let ack = authority
            .push(
                &doc_id(),
                client,
                vec![Mutation::create(point("a")), Mutation::create(point("b"))],
            )
            .await
            .unwrap();

        assert_eq!(ack.base_version, 0);
        assert_eq!(ack.version, 2);
        assert_eq!(ack.applied(), 2);
        assert_eq!(authority.pull(&doc_id()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retried_push_is_duplicate() {
        let authority = Authority::in_memory();
        let client = Uuid::new_v4();
        let m = Mutation::create(point("a"));

        authority.push(&doc_id(), client, vec![m.clone()]).await.unwrap();
        let ack = authority.push(&doc_id(), client, vec![m.clone()]).await.unwrap();

        assert_eq!(ack.status_of(m.id), Some(&MutationStatus::Duplicate));
        assert_eq!(ack.base_version, 1);
        assert_eq!(ack.version, 1);
        assert_eq!(authority.stats().await.mutations_duplicate, 1);
    }

    #[tokio::test]
    async fn test_rejected_mutation_does_not_stop_batch() {
        let authority = Authority::in_memory();
        let client = Uuid::new_v4();
        let bad = Mutation::set_property("ghost", "k", 1i64);
        let good = Mutation::create(point("a"));

        let ack = authority
            .push(&doc_id(), client, vec![bad.clone(), good.clone()])
            .await
            .unwrap();

        assert!(matches!(ack.status_of(bad.id), Some(MutationStatus::Rejected(_))));
        assert_eq!(ack.status_of(good.id), Some(&MutationStatus::Applied));
        assert_eq!(ack.version, 1);
    }

    #[tokio::test]
    async fn test_remote_delete_wins() {
        let authority = Authority::in_memory();
        let client = Uuid::new_v4();
        authority
            .push(&doc_id(), client, vec![Mutation::create(point("a"))])
            .await
            .unwrap();
        authority
            .push(&doc_id(), client, vec![Mutation::delete("a")])
            .await
            .unwrap();
        let ack = authority
            .push(&doc_id(), Uuid::new_v4(), vec![Mutation::delete("a")])
            .await
            .unwrap();
        assert_eq!(ack.applied(), 1);
    }

    #[tokio::test]
    async fn test_push_pokes_other_subscribers_only() {
        let authority = Authority::in_memory();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut alice_pokes = authority.subscribe(&doc_id(), alice).await;
        let mut bob_pokes = authority.subscribe(&doc_id(), bob).await;

        authority
            .push(&doc_id(), alice, vec![Mutation::create(point("a"))])
            .await
            .unwrap();

        assert_eq!(bob_pokes.recv().await, Some(()));
        assert!(timeout(Duration::from_millis(50), alice_pokes.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejected_only_push_does_not_poke() {
        let authority = Authority::in_memory();
        let mut pokes = authority.subscribe(&doc_id(), Uuid::new_v4()).await;

        let ack = authority
            .push(&doc_id(), Uuid::new_v4(), vec![Mutation::set_property("ghost", "k", 1i64)])
            .await
            .unwrap();
        assert_eq!(ack.applied(), 0);
        assert!(timeout(Duration::from_millis(50), pokes.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_restores_documents_and_dedup_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        let m = Mutation::create(point("a"));

        {
            let store = Arc::new(DocumentStore::open(config.clone()).unwrap());
            let authority = Authority::new(AuthorityConfig::for_testing(), Some(store));
            authority.push(&doc_id(), Uuid::new_v4(), vec![m.clone()]).await.unwrap();
        }

        let store = Arc::new(DocumentStore::open(config).unwrap());
        let authority = Authority::new(AuthorityConfig::for_testing(), Some(store));
        assert_eq!(authority.recover().await.unwrap(), 1);

        let doc = authority.pull(&doc_id()).await.unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.contains(&"a".into()));

        let ack = authority.push(&doc_id(), Uuid::new_v4(), vec![m.clone()]).await.unwrap();
        assert_eq!(ack.status_of(m.id), Some(&MutationStatus::Duplicate));
    }

    #[test]
    fn test_applied_window_evicts_oldest() {
        let mut window = AppliedWindow::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            window.insert(*id);
        }
        assert!(!window.contains(&ids[0]));
        assert!(window.contains(&ids[1]));
        assert!(window.contains(&ids[2]));
    }
}
