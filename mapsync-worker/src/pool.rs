//! Worker threads that execute geometry operations off the async runtime.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::geometry::OperationExecutor;
use crate::ops::{ComputationError, OperationRequest, OperationResponse};

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Capacity of the request queue; submissions beyond it are refused.
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get().clamp(1, 4))
            .unwrap_or(2);
        Self {
            threads,
            queue_depth: 64,
        }
    }
}

impl WorkerConfig {
    pub fn for_testing() -> Self {
        Self {
            threads: 2,
            queue_depth: 8,
        }
    }
}

/// Request ids cancelled before a worker picked them up.
pub(crate) type CancelledSet = Arc<Mutex<HashSet<u64>>>;

/// Spawn one worker thread.
///
/// The worker drains `requests` until every sender is gone, skipping ids
/// found in `cancelled`, and tags every answer with its request id.
pub(crate) fn spawn_worker(
    executor: Arc<dyn OperationExecutor>,
    requests: Receiver<OperationRequest>,
    responses: Sender<OperationResponse>,
    cancelled: CancelledSet,
    worker_index: usize,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mapsync-worker-{worker_index}"))
        .spawn(move || {
            while let Ok(request) = requests.recv() {
                if cancelled.lock().remove(&request.id) {
                    debug!("worker #{worker_index}: skipping cancelled request {}", request.id);
                    continue;
                }

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    executor.execute(request.operation, &request.feature, &request.options)
                }))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    warn!(
                        "worker #{worker_index}: {} panicked: {message}",
                        request.operation
                    );
                    Err(ComputationError::Panicked(message))
                });

                let response = OperationResponse {
                    id: request.id,
                    result,
                };
                if responses.send(response).is_err() {
                    debug!("worker #{worker_index}: response channel closed");
                    break;
                }
            }
            debug!("worker #{worker_index}: stopped");
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryLibrary;
    use crate::ops::{OperationName, OperationOptions};
    use mapsync_core::{Feature, Geometry};

    fn request(id: u64) -> OperationRequest {
        OperationRequest {
            id,
            operation: OperationName::CentroidFeature,
            feature: Feature::new("f", Geometry::LineString(vec![[0.0, 0.0], [2.0, 2.0]])),
            options: OperationOptions::None,
        }
    }

    #[test]
    fn test_worker_answers_and_skips_cancelled() {
        let (req_tx, req_rx) = crossbeam_channel::bounded(4);
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
        let cancelled: CancelledSet = Arc::default();
        cancelled.lock().insert(1);

        let handle = spawn_worker(Arc::new(GeometryLibrary), req_rx, resp_tx, cancelled.clone(), 0).unwrap();
        req_tx.send(request(1)).unwrap();
        req_tx.send(request(2)).unwrap();
        drop(req_tx);
        handle.join().unwrap();

        let answers: Vec<OperationResponse> = resp_rx.iter().collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id, 2);
        assert_eq!(
            answers[0].result.as_ref().unwrap().geometry,
            Geometry::Point([1.0, 1.0])
        );
        assert!(cancelled.lock().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
