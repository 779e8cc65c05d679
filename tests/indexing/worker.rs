#[path = "../common/mod.rs"]
mod common;

use archivist::indexing::{
    Indexer, IndexingWorker, PendingIndexEntry, PriorityIndexQueue, ShutdownMode,
};
use common::{location, RecordingIndexer};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn wait_for_calls(indexer: &RecordingIndexer, calls: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while indexer.calls.load(Ordering::SeqCst) < calls {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("indexer was not called in time");
}

#[tokio::test]
async fn indexes_priority_peer_first() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(["AE1"]));
    queue.push(PendingIndexEntry::new(location("ae2"), "AE2", 11));
    queue.push(PendingIndexEntry::new(location("ae1"), "AE1", 10));

    let indexer = Arc::new(RecordingIndexer::default());
    let shutdown = CancellationToken::new();
    let handle = IndexingWorker::new(queue.clone(), vec![indexer.clone() as Arc<dyn Indexer>])
        .spawn(shutdown.clone());

    wait_for_calls(&indexer, 2).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(indexer.seen(), vec![location("ae1"), location("ae2")]);
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.abandoned, 0);
}

#[tokio::test]
async fn failures_do_not_stop_the_loop() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(Vec::<String>::new()));
    let indexer = Arc::new(RecordingIndexer {
        fail_on: Some(location("bad")),
        ..Default::default()
    });

    queue.submit(location("bad"), "AE");
    queue.submit(location("good"), "AE");

    let shutdown = CancellationToken::new();
    let handle = IndexingWorker::new(queue.clone(), vec![indexer.clone() as Arc<dyn Indexer>])
        .spawn(shutdown.clone());

    wait_for_calls(&indexer, 2).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(indexer.seen(), vec![location("bad"), location("good")]);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn fail_fast_finishes_in_flight_and_abandons_backlog() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(Vec::<String>::new()));
    let indexer = Arc::new(RecordingIndexer {
        delay: Duration::from_millis(200),
        ..Default::default()
    });
    for i in 0..5 {
        queue.submit(location(&i.to_string()), "AE");
    }

    let shutdown = CancellationToken::new();
    let handle = IndexingWorker::new(queue.clone(), vec![indexer.clone() as Arc<dyn Indexer>])
        .with_shutdown_mode(ShutdownMode::FailFast)
        .spawn(shutdown.clone());

    // Cancel while the first entry is being indexed
    wait_for_calls(&indexer, 1).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(indexer.seen(), vec![location("0")]);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.abandoned, 4);
    assert_eq!(queue.len(), 4);
}

#[tokio::test]
async fn drain_mode_indexes_everything_queued() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(["AE1"]));
    let indexer = Arc::new(RecordingIndexer {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    queue.submit(location("n1"), "AE2");
    queue.submit(location("n2"), "AE2");
    queue.submit(location("p1"), "AE1");

    let shutdown = CancellationToken::new();
    let handle = IndexingWorker::new(queue.clone(), vec![indexer.clone() as Arc<dyn Indexer>])
        .with_shutdown_mode(ShutdownMode::Drain)
        .spawn(shutdown.clone());

    wait_for_calls(&indexer, 1).await;
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(
        indexer.seen(),
        vec![location("p1"), location("n1"), location("n2")]
    );
    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.abandoned, 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn idle_worker_stops_promptly() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(Vec::<String>::new()));
    let shutdown = CancellationToken::new();
    let handle = IndexingWorker::new(queue, Vec::new()).spawn(shutdown.clone());

    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(summary.indexed, 0);
}
