//! Session-scoped holder of the one live [`MapHandle`].
//!
//! The registry is created explicitly and cloned into whatever needs the
//! current map. Readers get a [`MapContext`], which is either a real handle
//! or `NotAvailable`; there is no placeholder handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use mapsync_core::WrappedFeatureCollectionId;
use parking_lot::Mutex;
use thiserror::Error;

use crate::handle::MapHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a map session for {0} is already registered")]
    AlreadyRegistered(WrappedFeatureCollectionId),
    #[error("no map session is registered")]
    NotAvailable,
}

#[derive(Debug, Clone)]
pub enum MapContext {
    Available(Arc<MapHandle>),
    NotAvailable,
}

impl MapContext {
    pub fn is_available(&self) -> bool {
        matches!(self, MapContext::Available(_))
    }

    pub fn handle(&self) -> Result<Arc<MapHandle>, RegistryError> {
        match self {
            MapContext::Available(handle) => Ok(handle.clone()),
            MapContext::NotAvailable => Err(RegistryError::NotAvailable),
        }
    }
}

struct Slot {
    generation: u64,
    handle: Arc<MapHandle>,
}

#[derive(Default)]
struct Inner {
    slot: Mutex<Option<Slot>>,
    generations: AtomicU64,
}

impl Inner {
    /// Remove the registered handle if it still belongs to `generation`.
    fn take(&self, generation: Option<u64>) -> Option<Arc<MapHandle>> {
        let mut slot = self.slot.lock();
        let owned = match (slot.as_ref(), generation) {
            (Some(current), Some(g)) => current.generation == g,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            slot.take().map(|s| s.handle)
        } else {
            None
        }
    }
}

#[derive(Clone, Default)]
pub struct MapContextRegistry {
    inner: Arc<Inner>,
}

impl MapContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the live session. Fails while another is registered.
    pub fn register(&self, handle: MapHandle) -> Result<MapHandleGuard, RegistryError> {
        let mut slot = self.inner.slot.lock();
        if let Some(current) = slot.as_ref() {
            return Err(RegistryError::AlreadyRegistered(current.handle.id().clone()));
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Arc::new(handle);
        info!("map session registered for {}", handle.id());
        *slot = Some(Slot {
            generation,
            handle: handle.clone(),
        });

        Ok(MapHandleGuard {
            registry: self.inner.clone(),
            generation,
            handle,
        })
    }

    pub fn current(&self) -> MapContext {
        match self.inner.slot.lock().as_ref() {
            Some(slot) => MapContext::Available(slot.handle.clone()),
            None => MapContext::NotAvailable,
        }
    }

    /// Unregister the live session and close its document.
    ///
    /// Returns `false` if nothing was registered.
    pub async fn teardown(&self) -> bool {
        match self.inner.take(None) {
            Some(handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }
}

/// Keeps a handle registered. Dropping it unregisters the handle and
/// closes its document on the current Tokio runtime.
pub struct MapHandleGuard {
    registry: Arc<Inner>,
    generation: u64,
    handle: Arc<MapHandle>,
}

impl MapHandleGuard {
    pub fn handle(&self) -> &Arc<MapHandle> {
        &self.handle
    }
}

impl std::fmt::Debug for MapHandleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapHandleGuard")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Drop for MapHandleGuard {
    fn drop(&mut self) {
        // Already torn down, possibly replaced by a newer session.
        let Some(handle) = self.registry.take(Some(self.generation)) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handle.close().await });
            }
            Err(_) => warn!(
                "map session for {} dropped outside a runtime; document left open",
                handle.id()
            ),
        }
    }
}
