//! # mapsync-session: The live map session
//!
//! A [`MapHandle`] ties one feature collection, opened through a
//! [`Persistence`](mapsync_collab::Persistence) backend, to the geometry
//! [`Dispatcher`](mapsync_worker::Dispatcher). The [`MapContextRegistry`]
//! holds at most one live handle and hands it out to anything that needs
//! the current map, with an explicit [`MapContext::NotAvailable`] state
//! before registration and after teardown.

pub mod handle;
pub mod registry;

pub use handle::{MapHandle, SessionError};
pub use registry::{MapContext, MapContextRegistry, MapHandleGuard, RegistryError};
