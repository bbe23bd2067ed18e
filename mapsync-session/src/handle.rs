//! The session object for one open feature collection.

use std::sync::Arc;

use log::{debug, info};
use mapsync_collab::{
    MutationReceipt, Persistence, PersistenceError, Snapshot, SnapshotStream, SyncStatus,
};
use mapsync_core::{Feature, FeatureId, Mutation, WrappedFeatureCollectionId};
use mapsync_worker::{DispatchError, Dispatcher, OperationError, OperationOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("feature {0} not found in the current snapshot")]
    UnknownFeature(FeatureId),
    #[error("document {0} is not open")]
    DocumentNotOpen(WrappedFeatureCollectionId),
}

/// One editing session: a document plus the operation dispatcher.
///
/// Cloning the `Arc`s is cheap; the handle itself is shared through the
/// registry as `Arc<MapHandle>`.
pub struct MapHandle {
    id: WrappedFeatureCollectionId,
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
}

impl MapHandle {
    pub fn new(
        id: WrappedFeatureCollectionId,
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            id,
            persistence,
            dispatcher,
        }
    }

    pub fn id(&self) -> &WrappedFeatureCollectionId {
        &self.id
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Subscribe to the document, opening it if needed.
    pub async fn snapshots(&self) -> SnapshotStream {
        self.persistence.subscribe(&self.id).await
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.persistence.snapshot(&self.id).await
    }

    pub async fn status(&self) -> Option<SyncStatus> {
        self.persistence.status(&self.id).await
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationReceipt, SessionError> {
        Ok(self.persistence.mutate(&self.id, mutation).await?)
    }

    /// Run a named geometry operation on `feature` off the async runtime.
    ///
    /// The result is returned to the caller and not written anywhere.
    pub async fn run_operation(
        &self,
        name: &str,
        feature: Feature,
        options: OperationOptions,
    ) -> Result<Feature, SessionError> {
        let pending = self.dispatcher.run(name, feature, options)?;
        Ok(pending.await?)
    }

    /// Run `name` on the feature `feature_id` as it is in the current
    /// snapshot and add the derived feature to the document.
    pub async fn apply_operation(
        &self,
        name: &str,
        feature_id: &FeatureId,
        options: OperationOptions,
    ) -> Result<Feature, SessionError> {
        let snapshot = self
            .snapshot()
            .await
            .ok_or_else(|| SessionError::DocumentNotOpen(self.id.clone()))?;
        let input = snapshot
            .get(feature_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownFeature(feature_id.clone()))?;

        let derived = self.run_operation(name, input, options).await?;
        debug!("{name} on {feature_id} produced {}", derived.id);
        self.mutate(Mutation::create(derived.clone())).await?;
        Ok(derived)
    }

    /// Close the document. Snapshot streams handed out by this handle end.
    pub async fn close(&self) {
        info!("closing map session for {}", self.id);
        self.persistence.close(&self.id).await;
    }
}

impl std::fmt::Debug for MapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHandle").field("id", &self.id).finish()
    }
}
