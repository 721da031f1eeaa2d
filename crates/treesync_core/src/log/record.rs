//! Records stored in the write-ahead log and the snapshot file.

use crate::node::NodeRecord;
use crate::outbound::PendingChange;
use crate::types::{NodeId, ReplicaId, SequenceNumber};
use serde::{Deserialize, Serialize};

/// One write-ahead log entry.
///
/// A commit is a run of `Put`/`Delete`/`Outbound` entries sharing a
/// `txid`, closed by a `Commit`. Entries of a transaction whose `Commit`
/// never made it to disk are discarded on recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Identity of the store, written once when the log is created.
    Meta {
        /// Replica id used in logical timestamps.
        replica: ReplicaId,
    },
    /// New state of a node.
    Put {
        /// Owning transaction.
        txid: u64,
        /// The record after the write.
        record: NodeRecord,
    },
    /// Removal of a node.
    Delete {
        /// Owning transaction.
        txid: u64,
        /// Removed node.
        id: NodeId,
    },
    /// A change queued for the sync authority.
    Outbound {
        /// Owning transaction.
        txid: u64,
        /// The queued change.
        change: PendingChange,
    },
    /// Makes the preceding entries of `txid` durable.
    Commit {
        /// Transaction being committed.
        txid: u64,
        /// Commit sequence number.
        seq: SequenceNumber,
        /// Lamport counter after the commit.
        clock: u64,
    },
    /// The authority acknowledged outbound changes up to `up_to`.
    Ack {
        /// Highest acknowledged outbound sequence number.
        up_to: SequenceNumber,
    },
}

impl LogRecord {
    /// Short name used by diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Meta { .. } => "meta",
            LogRecord::Put { .. } => "put",
            LogRecord::Delete { .. } => "delete",
            LogRecord::Outbound { .. } => "outbound",
            LogRecord::Commit { .. } => "commit",
            LogRecord::Ack { .. } => "ack",
        }
    }
}

/// Full state of a store at a commit boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Replica id of the store.
    pub replica: ReplicaId,
    /// Lamport counter.
    pub clock: u64,
    /// Last commit included.
    pub commit_seq: SequenceNumber,
    /// Next outbound sequence number.
    pub next_outbound: SequenceNumber,
    /// Every node.
    pub nodes: Vec<NodeRecord>,
    /// Unacknowledged outbound changes.
    pub pending: Vec<PendingChange>,
}
