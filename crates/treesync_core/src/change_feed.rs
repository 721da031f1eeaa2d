//! Change feed of committed writes.
//!
//! Every commit, local or remote, emits one [`ChangeRecord`] per node it
//! touched. Consumers either take a channel from [`ChangeFeed::subscribe`],
//! register a cheap synchronous watcher with [`ChangeFeed::watch`] (the sync
//! engine uses one to wake up after local commits), or poll the bounded
//! history.

use crate::node::NodeField;
use crate::types::{NodeId, OwnerId, SequenceNumber};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// What happened to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// The node was created.
    Inserted,
    /// The listed fields changed.
    Modified(Vec<NodeField>),
    /// The node was removed.
    Deleted,
}

/// Where a commit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A caller transaction on this store.
    Local,
    /// Changes applied from the sync authority.
    Remote,
}

/// One node touched by one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Commit sequence number.
    pub seq: SequenceNumber,
    /// Node touched.
    pub node_id: NodeId,
    /// Owner of the node.
    pub owner_id: OwnerId,
    /// What happened.
    pub kind: ChangeKind,
    /// Where the commit came from.
    pub origin: ChangeOrigin,
}

/// Handle returned by [`ChangeFeed::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

type Watcher = Arc<dyn Fn(&[ChangeRecord]) + Send + Sync>;

/// Distributes committed changes.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeRecord>>>,
    watchers: RwLock<Vec<(WatchId, Watcher)>>,
    history: RwLock<Vec<ChangeRecord>>,
    max_history: usize,
    next_watch: AtomicU64,
}

impl ChangeFeed {
    /// Creates a feed keeping `max_history` records for polling.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            watchers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            next_watch: AtomicU64::new(1),
        }
    }

    /// Returns a receiver for every future change.
    pub fn subscribe(&self) -> Receiver<ChangeRecord> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a callback invoked with each committed batch.
    ///
    /// Watchers run on the committing thread while the store's writer lock
    /// is held, so they must be quick and must not write to the store.
    pub fn watch<F>(&self, callback: F) -> WatchId
    where
        F: Fn(&[ChangeRecord]) + Send + Sync + 'static,
    {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.watchers.write().push((id, Arc::new(callback)));
        id
    }

    /// Removes a watcher. Returns false if it was not registered.
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watchers = self.watchers.write();
        let before = watchers.len();
        watchers.retain(|(w, _)| *w != id);
        watchers.len() != before
    }

    /// Emits the records of one commit.
    pub fn emit_batch(&self, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        {
            let mut history = self.history.write();
            history.extend_from_slice(records);
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        self.subscribers
            .write()
            .retain(|tx| records.iter().all(|r| tx.send(r.clone()).is_ok()));

        let watchers: Vec<Watcher> = self.watchers.read().iter().map(|(_, w)| w.clone()).collect();
        for watcher in watchers {
            watcher(records);
        }
    }

    /// Records with `seq > cursor`, oldest first, at most `limit`.
    #[must_use]
    pub fn poll(&self, cursor: SequenceNumber, limit: usize) -> Vec<ChangeRecord> {
        self.history
            .read()
            .iter()
            .filter(|r| r.seq > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sequence number of the newest record in history.
    #[must_use]
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.history
            .read()
            .last()
            .map(|r| r.seq)
            .unwrap_or_default()
    }

    /// Number of live channel subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drops every subscriber and watcher.
    pub fn shutdown(&self) {
        self.subscribers.write().clear();
        self.watchers.write().clear();
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_max_history(4096)
    }
}
