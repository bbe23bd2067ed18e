//! # mapsync-worker: Geometry operation offload
//!
//! Heavy geometry operations run on dedicated OS threads so the async
//! runtime driving documents and sockets never blocks on them.
//!
//! - [`Dispatcher`] validates an operation name, enqueues the request and
//!   returns a [`PendingOperation`] future.
//! - Worker threads execute requests through an [`OperationExecutor`]
//!   ([`GeometryLibrary`] by default).
//! - A router thread matches tagged responses back to their futures.

pub mod dispatcher;
pub mod geometry;
pub mod ops;
pub mod pool;

pub use dispatcher::{DispatchError, Dispatcher, OperationError, PendingOperation};
pub use geometry::{GeometryLibrary, OperationExecutor};
pub use ops::{
    BufferOptions, ComputationError, OperationName, OperationOptions, UnsupportedOperationError,
    WORKER_API_VERSION,
};
pub use pool::WorkerConfig;
