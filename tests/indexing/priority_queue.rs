#[path = "../common/mod.rs"]
mod common;

use archivist::indexing::{PendingIndexEntry, PriorityIndexQueue};
use common::location;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn priority_tier_comes_before_lower_sequence() {
    let queue = PriorityIndexQueue::with_priority_aets(["AE1"]);
    queue.push(PendingIndexEntry::new(location("b"), "AE2", 11));
    queue.push(PendingIndexEntry::new(location("a"), "AE1", 10));
    queue.push(PendingIndexEntry::new(location("c"), "AE2", 3));
    queue.push(PendingIndexEntry::new(location("d"), "AE1", 42));

    let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
        .map(|entry| entry.sequence)
        .collect();
    assert_eq!(order, vec![10, 42, 3, 11]);
}

#[test]
fn each_tier_is_fifo() {
    let queue = PriorityIndexQueue::with_priority_aets(["CT"]);
    for i in 0..20 {
        let aet = if i % 3 == 0 { "CT" } else { "MR" };
        queue.submit(location(&i.to_string()), aet);
    }

    let popped: Vec<PendingIndexEntry> = std::iter::from_fn(|| queue.try_pop()).collect();
    let (priority, normal): (Vec<_>, Vec<_>) =
        popped.iter().partition(|entry| entry.origin_aet == "CT");

    // All priority entries first
    assert!(popped[..priority.len()]
        .iter()
        .all(|entry| entry.origin_aet == "CT"));
    assert!(priority.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(normal.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn sequence_numbers_start_at_zero_and_increase() {
    let queue = PriorityIndexQueue::with_priority_aets(Vec::<String>::new());
    let sequences: Vec<u64> = (0..5)
        .map(|i| queue.submit(location(&i.to_string()), "AE"))
        .collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_get_distinct_consecutive_sequences() {
    let queue = Arc::new(PriorityIndexQueue::with_priority_aets(["AE1"]));
    let producers = 8;
    let per_producer = 250;

    let mut tasks = Vec::new();
    for p in 0..producers {
        let queue = Arc::clone(&queue);
        tasks.push(tokio::spawn(async move {
            let aet = if p % 2 == 0 { "AE1" } else { "AE2" };
            (0..per_producer)
                .map(|i| queue.submit(location(&format!("{p}-{i}")), aet))
                .collect::<Vec<u64>>()
        }));
    }

    let mut sequences = Vec::new();
    for task in tasks {
        sequences.extend(task.await.unwrap());
    }

    let total = (producers * per_producer) as u64;
    let unique: HashSet<u64> = sequences.iter().copied().collect();
    assert_eq!(unique.len() as u64, total);
    assert_eq!(unique, (0..total).collect::<HashSet<u64>>());
    assert_eq!(queue.len() as u64, total);
}

#[test]
fn reclassifying_peers_affects_queued_entries() {
    let queue = PriorityIndexQueue::with_priority_aets(Vec::<String>::new());
    queue.submit(location("first"), "AE2");
    queue.submit(location("second"), "AE1");

    queue.set_priority_peers(["AE1"]);
    assert!(queue.priority_peers().contains("AE1"));

    assert_eq!(queue.try_pop().unwrap().origin_aet, "AE1");
    assert_eq!(queue.try_pop().unwrap().origin_aet, "AE2");
}

#[tokio::test]
async fn pop_returns_entries_in_priority_order() {
    let queue = PriorityIndexQueue::with_priority_aets(["AE1"]);
    queue.submit(location("x"), "AE2");
    queue.submit(location("y"), "AE1");

    assert_eq!(queue.pop().await.location, location("y"));
    assert_eq!(queue.pop().await.location, location("x"));
    assert!(queue.is_empty());
}
