//! The dispatcher: a façade that hands operations to the worker pool and
//! resolves the answers as futures.
//!
//! ```text
//!   run() ──try_send──► [bounded queue] ──► worker threads
//!     │                                        │
//!     └─ oneshot ◄── router thread ◄── [responses, tagged by id]
//! ```
//!
//! Responses are matched to callers by correlation id, so workers may finish
//! in any order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use mapsync_core::Feature;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::geometry::{GeometryLibrary, OperationExecutor};
use crate::ops::{
    ComputationError, OperationName, OperationOptions, OperationRequest, OperationResponse,
    UnsupportedOperationError,
};
use crate::pool::{spawn_worker, CancelledSet, WorkerConfig};

/// Why an operation could not be submitted.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOperationError),
    #[error("invalid options for {operation}: {reason}")]
    InvalidOptions {
        operation: OperationName,
        reason: String,
    },
    /// The request queue is full. Nothing was enqueued.
    #[error("worker queue is full")]
    Busy,
    #[error("dispatcher is shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why a submitted operation produced no feature.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Computation(#[from] ComputationError),
    #[error("worker pool stopped before answering")]
    WorkerGone,
}

type Completion = oneshot::Sender<Result<Feature, ComputationError>>;

struct Shared {
    pending: Mutex<HashMap<u64, Completion>>,
    cancelled: CancelledSet,
}

impl Shared {
    /// The `pending` guard is held across the insert so the router cannot
    /// discard the late answer in between and leave the id behind.
    fn cancel(&self, id: u64) {
        let mut pending = self.pending.lock();
        if pending.remove(&id).is_some() {
            self.cancelled.lock().insert(id);
        }
    }
}

pub struct Dispatcher {
    requests: Option<Sender<OperationRequest>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    workers: Vec<thread::JoinHandle<()>>,
    router: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(config: WorkerConfig) -> Result<Self, DispatchError> {
        Self::with_executor(config, Arc::new(GeometryLibrary))
    }

    pub fn with_executor(
        config: WorkerConfig,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self, DispatchError> {
        let (req_tx, req_rx) = crossbeam_channel::bounded(config.queue_depth.max(1));
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            cancelled: CancelledSet::default(),
        });

        let threads = config.threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            workers.push(spawn_worker(
                executor.clone(),
                req_rx.clone(),
                resp_tx.clone(),
                shared.cancelled.clone(),
                index,
            )?);
        }
        drop(resp_tx);

        let router = spawn_router(resp_rx, shared.clone())?;
        info!(
            "dispatcher started: {threads} worker(s), queue depth {}",
            config.queue_depth.max(1)
        );

        Ok(Self {
            requests: Some(req_tx),
            shared,
            next_id: AtomicU64::new(1),
            workers,
            router: Some(router),
        })
    }

    /// Submit `operation` for `feature`.
    ///
    /// Unknown names and malformed options fail here without reaching a
    /// worker. The returned future resolves with the derived feature.
    pub fn run(
        &self,
        operation: &str,
        feature: Feature,
        options: OperationOptions,
    ) -> Result<PendingOperation, DispatchError> {
        let operation: OperationName = operation.parse()?;
        self.submit(operation, feature, options)
    }

    pub fn submit(
        &self,
        operation: OperationName,
        feature: Feature,
        options: OperationOptions,
    ) -> Result<PendingOperation, DispatchError> {
        operation
            .check_options(&options)
            .map_err(|reason| DispatchError::InvalidOptions { operation, reason })?;
        let requests = self.requests.as_ref().ok_or(DispatchError::ShutDown)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let request = OperationRequest {
            id,
            operation,
            feature,
            options,
        };
        match requests.try_send(request) {
            Ok(()) => {
                debug!("dispatched {operation} as request {id}");
                Ok(PendingOperation {
                    id,
                    operation,
                    rx,
                    shared: self.shared.clone(),
                    finished: false,
                })
            }
            Err(err) => {
                self.shared.pending.lock().remove(&id);
                match err {
                    TrySendError::Full(_) => Err(DispatchError::Busy),
                    TrySendError::Disconnected(_) => Err(DispatchError::ShutDown),
                }
            }
        }
    }

    /// Operations submitted and not yet answered or cancelled.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the queue lets workers drain and exit; the router follows
        // once the last worker drops its response sender.
        self.requests.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                warn!("router thread panicked during shutdown");
            }
        }
        info!("dispatcher stopped");
    }
}

fn spawn_router(
    responses: Receiver<OperationResponse>,
    shared: Arc<Shared>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("mapsync-router".to_string())
        .spawn(move || {
            for response in responses.iter() {
                let waiter = shared.pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        // The receiver may have been dropped in the meantime.
                        let _ = tx.send(response.result);
                    }
                    None => {
                        shared.cancelled.lock().remove(&response.id);
                        debug!("discarding late result for request {}", response.id);
                    }
                }
            }
            // Outstanding callers observe `WorkerGone`.
            shared.pending.lock().clear();
        })
}

/// A submitted operation. Resolves once a worker answers.
///
/// Dropping it before completion cancels the request: a worker that has not
/// started it skips it, and a late answer is discarded.
#[must_use = "dropping a PendingOperation cancels it"]
pub struct PendingOperation {
    id: u64,
    operation: OperationName,
    rx: oneshot::Receiver<Result<Feature, ComputationError>>,
    shared: Arc<Shared>,
    finished: bool,
}

impl PendingOperation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operation(&self) -> OperationName {
        self.operation
    }

    pub fn cancel(mut self) {
        self.finished = true;
        self.shared.cancel(self.id);
    }
}

impl Future for PendingOperation {
    type Output = Result<Feature, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.finished = true;
                Poll::Ready(result.map_err(OperationError::from))
            }
            Poll::Ready(Err(_)) => {
                self.finished = true;
                Poll::Ready(Err(OperationError::WorkerGone))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .finish()
    }
}
