//! The pending outbound change log.
//!
//! Every local commit appends one entry per touched node. Entries stay
//! until the sync authority acknowledges them, survive restarts through
//! the write-ahead log, and are drained in sequence order.

use crate::merge::PendingEdits;
use crate::node::NodeField;
use crate::types::{LogicalTimestamp, NodeId, OwnerId, SequenceNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a pending change did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    /// The node was created or some of its fields were rewritten.
    Upsert {
        /// Whether this change created the node.
        created: bool,
        /// Fields the change wrote.
        fields: Vec<NodeField>,
        /// `text_ts` before the change, when it rewrote `text` of an
        /// existing node.
        text_base: Option<LogicalTimestamp>,
    },
    /// The node was deleted.
    Delete,
}

/// A committed local change waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Position in the outbound log.
    pub seq: SequenceNumber,
    /// Node touched.
    pub node_id: NodeId,
    /// Owner of the node.
    pub owner_id: OwnerId,
    /// What happened.
    pub kind: PendingKind,
    /// Commit timestamp.
    pub committed_at: LogicalTimestamp,
}

impl PendingChange {
    /// Returns true for deletions.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, PendingKind::Delete)
    }
}

/// In-memory view of the outbound log.
#[derive(Debug, Clone)]
pub struct OutboundLog {
    entries: BTreeMap<SequenceNumber, PendingChange>,
    next_seq: SequenceNumber,
}

impl Default for OutboundLog {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: SequenceNumber::new(1),
        }
    }
}

impl OutboundLog {
    /// Creates an empty log whose first entry will get sequence 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries.
    #[must_use]
    pub fn restore(entries: Vec<PendingChange>, next_seq: SequenceNumber) -> Self {
        let mut log = Self {
            entries: BTreeMap::new(),
            next_seq,
        };
        for entry in entries {
            log.insert(entry);
        }
        log
    }

    /// Allocates the next sequence number.
    pub fn allocate(&mut self) -> SequenceNumber {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        seq
    }

    /// Sequence number the next entry will receive.
    #[must_use]
    pub fn next_seq(&self) -> SequenceNumber {
        self.next_seq
    }

    /// Inserts an entry, keeping `next_seq` ahead of it.
    pub fn insert(&mut self, entry: PendingChange) {
        if entry.seq >= self.next_seq {
            self.next_seq = entry.seq.next();
        }
        self.entries.insert(entry.seq, entry);
    }

    /// Drops every entry with `seq <= up_to`; returns how many were dropped.
    pub fn acknowledge(&mut self, up_to: SequenceNumber) -> usize {
        let keep = self.entries.split_off(&up_to.next());
        let dropped = self.entries.len();
        self.entries = keep;
        dropped
    }

    /// Oldest `limit` entries in sequence order.
    #[must_use]
    pub fn oldest(&self, limit: usize) -> Vec<PendingChange> {
        self.entries.values().take(limit).cloned().collect()
    }

    /// All entries in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingChange> {
        self.entries.values()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if any entry touches `id`.
    #[must_use]
    pub fn touches(&self, id: &NodeId) -> bool {
        self.entries.values().any(|e| e.node_id == *id)
    }

    /// Returns true if the latest entry for `id` is a deletion.
    #[must_use]
    pub fn deletes(&self, id: &NodeId) -> bool {
        self.entries
            .values()
            .rev()
            .find(|e| e.node_id == *id)
            .is_some_and(PendingChange::is_delete)
    }

    /// Summarises unacknowledged edits to `id` for conflict detection.
    #[must_use]
    pub fn edits_for(&self, id: &NodeId) -> PendingEdits {
        let mut edits = PendingEdits::default();
        for entry in self.entries.values().filter(|e| e.node_id == *id) {
            edits.any = true;
            if let PendingKind::Upsert {
                created,
                fields,
                text_base,
            } = &entry.kind
            {
                if *created {
                    continue;
                }
                if edits.text_base.is_none() && fields.contains(&NodeField::Text) {
                    edits.text_base = *text_base;
                }
                if fields.contains(&NodeField::Children) {
                    edits.children = true;
                }
            }
        }
        edits
    }
}
