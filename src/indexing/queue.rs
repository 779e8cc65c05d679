use crate::indexing::{PendingIndexEntry, PriorityPeers};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use url::Url;

/// Heap slot; ranks against the live priority peer set
struct Ranked {
    entry: PendingIndexEntry,
    peers: Arc<PriorityPeers>,
}

impl Ranked {
    fn is_priority(&self) -> bool {
        self.peers.contains(&self.entry.origin_aet)
    }
}

impl Ord for Ranked {
    // BinaryHeap pops the greatest: priority tier first, then lowest sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.is_priority()
            .cmp(&other.is_priority())
            .then_with(|| other.entry.sequence.cmp(&self.entry.sequence))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Unbounded queue of locations awaiting indexing.
///
/// Entries from priority peers always come out before the rest; ties break on
/// the submission sequence, so each tier is FIFO. Any number of producers may
/// submit concurrently while one consumer pops.
pub struct PriorityIndexQueue {
    heap: Mutex<BinaryHeap<Ranked>>,
    peers: Arc<PriorityPeers>,
    next_sequence: AtomicU64,
    available: Notify,
}

impl PriorityIndexQueue {
    pub fn new(peers: Arc<PriorityPeers>) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            peers,
            next_sequence: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    pub fn with_priority_aets<I, S>(aets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(PriorityPeers::new(aets)))
    }

    /// Enqueue a freshly stored location and return its sequence number
    pub fn submit(&self, location: Url, origin_aet: impl Into<String>) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.push(PendingIndexEntry::new(location, origin_aet, sequence));
        sequence
    }

    /// Enqueue an entry that already carries its sequence number
    pub fn push(&self, entry: PendingIndexEntry) {
        self.heap.lock().push(Ranked {
            entry,
            peers: Arc::clone(&self.peers),
        });
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<PendingIndexEntry> {
        self.heap.lock().pop().map(|ranked| ranked.entry)
    }

    /// Wait for the next entry
    ///
    /// Cancel safe: dropping the future never loses an entry.
    pub async fn pop(&self) -> PendingIndexEntry {
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn priority_peers(&self) -> &Arc<PriorityPeers> {
        &self.peers
    }

    /// Swap the priority peer set and re-rank everything already queued
    pub fn set_priority_peers<I, S>(&self, aets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let aets: HashSet<String> = aets.into_iter().map(Into::into).collect();
        let mut heap = self.heap.lock();
        self.peers.replace(aets);
        let entries = std::mem::take(&mut *heap).into_vec();
        *heap = BinaryHeap::from(entries);
    }
}

impl std::fmt::Debug for PriorityIndexQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityIndexQueue")
            .field("len", &self.len())
            .field("priority_aets", &self.peers.snapshot())
            .finish()
    }
}
