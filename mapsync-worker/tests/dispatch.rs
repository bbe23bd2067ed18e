use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mapsync_core::{Feature, Geometry, PropertyValue};
use mapsync_worker::{
    ComputationError, DispatchError, Dispatcher, OperationError, OperationExecutor,
    OperationName, OperationOptions, WorkerConfig,
};

/// Sleeps for the number of milliseconds stored in the `delay_ms` property,
/// then echoes the feature back under a derived id.
struct SlowEcho {
    executed: AtomicUsize,
}

impl SlowEcho {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: AtomicUsize::new(0),
        })
    }
}

impl OperationExecutor for SlowEcho {
    fn execute(
        &self,
        _operation: OperationName,
        feature: &Feature,
        _options: &OperationOptions,
    ) -> Result<Feature, ComputationError> {
        if let Some(PropertyValue::Int(ms)) = feature.property("delay_ms") {
            std::thread::sleep(Duration::from_millis(*ms as u64));
        }
        if feature.property("panic").is_some() {
            panic!("executor exploded");
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        let mut out = feature.clone();
        out.id = format!("{}-out", feature.id).into();
        Ok(out)
    }
}

fn feature(id: &str, delay_ms: i64) -> Feature {
    Feature::new(id, Geometry::Point([0.0, 0.0])).with_property("delay_ms", delay_ms)
}

fn config(threads: usize, queue_depth: usize) -> WorkerConfig {
    WorkerConfig {
        threads,
        queue_depth,
    }
}

#[tokio::test]
async fn test_out_of_order_responses_matched_by_id() {
    let dispatcher = Dispatcher::with_executor(config(2, 8), SlowEcho::new()).unwrap();

    let slow = dispatcher
        .run("centroidFeature", feature("slow", 300), OperationOptions::None)
        .unwrap();
    let fast = dispatcher
        .run("centroidFeature", feature("fast", 0), OperationOptions::None)
        .unwrap();

    // `fast` finishes first even though it was submitted second.
    let fast_result = fast.await.unwrap();
    assert_eq!(fast_result.id.as_str(), "fast-out");
    let slow_result = slow.await.unwrap();
    assert_eq!(slow_result.id.as_str(), "slow-out");
}

#[tokio::test]
async fn test_many_concurrent_operations_resolve_to_their_own_input() {
    let dispatcher = Dispatcher::with_executor(config(4, 64), SlowEcho::new()).unwrap();

    let pending: Vec<_> = (0..32)
        .map(|i| {
            let delay = (32 - i) % 7;
            dispatcher
                .run(
                    "centroidFeature",
                    feature(&format!("f{i}"), delay),
                    OperationOptions::None,
                )
                .unwrap()
        })
        .collect();

    for (i, op) in pending.into_iter().enumerate() {
        assert_eq!(op.await.unwrap().id.as_str(), format!("f{i}-out"));
    }
    assert_eq!(dispatcher.in_flight(), 0);
}

#[test]
fn test_unsupported_operation_never_reaches_worker() {
    let executor = SlowEcho::new();
    let dispatcher = Dispatcher::with_executor(config(1, 4), executor.clone()).unwrap();

    let err = dispatcher
        .run("simplifyFeature", feature("a", 0), OperationOptions::None)
        .unwrap_err();
    match err {
        DispatchError::Unsupported(e) => assert_eq!(e.0, "simplifyFeature"),
        other => panic!("unexpected error: {other:?}"),
    }
    drop(dispatcher);
    assert_eq!(executor.executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_queue_reports_busy() {
    let dispatcher = Dispatcher::with_executor(config(1, 1), SlowEcho::new()).unwrap();

    // Occupies the single worker.
    let first = dispatcher
        .run("centroidFeature", feature("a", 300), OperationOptions::None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Fills the single queue slot.
    let second = dispatcher
        .run("centroidFeature", feature("b", 0), OperationOptions::None)
        .unwrap();

    let err = dispatcher
        .run("centroidFeature", feature("c", 0), OperationOptions::None)
        .unwrap_err();
    assert!(matches!(err, DispatchError::Busy));
    assert_eq!(dispatcher.in_flight(), 2);

    assert_eq!(first.await.unwrap().id.as_str(), "a-out");
    assert_eq!(second.await.unwrap().id.as_str(), "b-out");
}

#[tokio::test]
async fn test_cancelled_request_is_skipped() {
    let executor = SlowEcho::new();
    let dispatcher = Dispatcher::with_executor(config(1, 4), executor.clone()).unwrap();

    let blocker = dispatcher
        .run("centroidFeature", feature("blocker", 200), OperationOptions::None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let doomed = dispatcher
        .run("centroidFeature", feature("doomed", 0), OperationOptions::None)
        .unwrap();
    doomed.cancel();
    assert_eq!(dispatcher.in_flight(), 1);

    let dropped = dispatcher
        .run("centroidFeature", feature("dropped", 0), OperationOptions::None)
        .unwrap();
    drop(dropped);

    let survivor = dispatcher
        .run("centroidFeature", feature("survivor", 0), OperationOptions::None)
        .unwrap();

    blocker.await.unwrap();
    assert_eq!(survivor.await.unwrap().id.as_str(), "survivor-out");
    assert_eq!(executor.executed.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn test_panic_becomes_typed_error() {
    let dispatcher = Dispatcher::with_executor(config(1, 4), SlowEcho::new()).unwrap();

    let boom = Feature::new("boom", Geometry::Point([0.0, 0.0])).with_property("panic", true);
    let err = dispatcher
        .run("centroidFeature", boom, OperationOptions::None)
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OperationError::Computation(ComputationError::Panicked("executor exploded".to_string()))
    );

    // The worker thread survives the panic.
    let ok = dispatcher
        .run("centroidFeature", feature("after", 0), OperationOptions::None)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ok.id.as_str(), "after-out");
}

#[tokio::test]
async fn test_default_library_end_to_end() {
    let dispatcher = Dispatcher::new(WorkerConfig::for_testing()).unwrap();
    let square = Feature::new(
        "sq",
        Geometry::Polygon(vec![vec![
            [0.0, 0.0],
            [4.0, 0.0],
            [4.0, 4.0],
            [0.0, 4.0],
            [0.0, 0.0],
        ]]),
    )
    .with_property("name", "plot");

    let centroid = dispatcher
        .run("centroidFeature", square.clone(), OperationOptions::None)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(centroid.geometry, Geometry::Point([2.0, 2.0]));
    assert_eq!(centroid.properties, square.properties);

    let bbox = dispatcher
        .run("boundingBoxFeature", square, OperationOptions::None)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(bbox.geometry.bbox(), Some([0.0, 0.0, 4.0, 4.0]));
}
