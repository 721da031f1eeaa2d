//! Durable storage of the object table and the outbound change log.
//!
//! Two backends back a store:
//!
//! - the write-ahead log, appended on every commit, and
//! - the snapshot, replaced wholesale on checkpoint, after which the log
//!   is truncated.
//!
//! Recovery loads the snapshot and replays committed log transactions
//! newer than it. A torn final frame is cut off and ignored; any other
//! damage fails the open.

mod frame;
mod record;

pub use frame::{compute_crc32, encode_frame, FrameReader, SNAPSHOT_MAGIC, WAL_MAGIC};
pub use record::{LogRecord, Snapshot};

use crate::error::{CoreError, CoreResult};
use crate::node::NodeRecord;
use crate::outbound::{OutboundLog, PendingChange};
use crate::types::{NodeId, ReplicaId, SequenceNumber};
use std::collections::HashMap;
use tracing::{debug, warn};
use treesync_codec::{from_cbor, to_cbor};
use treesync_storage::StorageBackend;

/// State reconstructed from disk.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub replica: Option<ReplicaId>,
    pub nodes: HashMap<NodeId, NodeRecord>,
    pub outbound: OutboundLog,
    pub clock: u64,
    pub commit_seq: SequenceNumber,
    pub replayed: usize,
    pub discarded: usize,
}

/// The pair of backends behind a store.
pub(crate) struct StoreLog {
    wal: Box<dyn StorageBackend>,
    snapshot: Box<dyn StorageBackend>,
    sync_on_commit: bool,
    commits_since_checkpoint: u64,
}

impl StoreLog {
    pub fn new(
        wal: Box<dyn StorageBackend>,
        snapshot: Box<dyn StorageBackend>,
        sync_on_commit: bool,
    ) -> Self {
        Self {
            wal,
            snapshot,
            sync_on_commit,
            commits_since_checkpoint: 0,
        }
    }

    /// Loads the snapshot and replays the log.
    pub fn recover(&mut self) -> CoreResult<Recovered> {
        let mut state = Recovered::default();

        let snapshot_bytes = self.snapshot.read_all()?;
        if !snapshot_bytes.is_empty() {
            let mut reader = FrameReader::new(&snapshot_bytes, SNAPSHOT_MAGIC);
            let payload = reader
                .next_frame()?
                .ok_or_else(|| CoreError::log_corruption(0, "incomplete snapshot"))?;
            let snapshot: Snapshot = from_cbor(payload)?;
            debug!(
                nodes = snapshot.nodes.len(),
                pending = snapshot.pending.len(),
                "loaded snapshot"
            );
            state.replica = Some(snapshot.replica);
            state.clock = snapshot.clock;
            state.commit_seq = snapshot.commit_seq;
            state.nodes = snapshot.nodes.into_iter().map(|r| (r.id, r)).collect();
            state.outbound = OutboundLog::restore(snapshot.pending, snapshot.next_outbound);
        }
        let snapshot_seq = state.commit_seq;

        let wal_bytes = self.wal.read_all()?;
        let mut reader = FrameReader::new(&wal_bytes, WAL_MAGIC);
        let mut open: HashMap<u64, Vec<LogRecord>> = HashMap::new();
        while let Some(payload) = reader.next_frame()? {
            let record: LogRecord = from_cbor(payload)?;
            match record {
                LogRecord::Meta { replica } => {
                    state.replica.get_or_insert(replica);
                }
                LogRecord::Put { txid, .. }
                | LogRecord::Delete { txid, .. }
                | LogRecord::Outbound { txid, .. } => open.entry(txid).or_default().push(record),
                LogRecord::Commit { txid, seq, clock } => {
                    let ops = open.remove(&txid).unwrap_or_default();
                    if seq <= snapshot_seq {
                        continue;
                    }
                    for op in ops {
                        match op {
                            LogRecord::Put { record, .. } => {
                                state.nodes.insert(record.id, record);
                            }
                            LogRecord::Delete { id, .. } => {
                                state.nodes.remove(&id);
                            }
                            LogRecord::Outbound { change, .. } => state.outbound.insert(change),
                            _ => {}
                        }
                    }
                    state.commit_seq = seq;
                    state.clock = state.clock.max(clock);
                    state.replayed += 1;
                }
                LogRecord::Ack { up_to } => {
                    state.outbound.acknowledge(up_to);
                }
            }
        }

        state.discarded = open.len();
        if !open.is_empty() {
            debug!(
                transactions = open.len(),
                "discarding uncommitted log entries"
            );
        }
        if reader.torn() {
            warn!(offset = reader.offset(), "truncating torn log tail");
            self.wal.truncate(reader.offset())?;
        }
        Ok(state)
    }

    /// Appends records as one write and makes them durable.
    pub fn append(&mut self, records: &[LogRecord]) -> CoreResult<()> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend(encode_frame(WAL_MAGIC, &to_cbor(record)?));
        }
        self.wal.append(&buf)?;
        if self.sync_on_commit {
            self.wal.sync()?;
        } else {
            self.wal.flush()?;
        }
        Ok(())
    }

    /// Counts a commit towards the automatic checkpoint interval.
    pub fn note_commit(&mut self) -> u64 {
        self.commits_since_checkpoint += 1;
        self.commits_since_checkpoint
    }

    /// Replaces the snapshot and empties the log.
    pub fn checkpoint(&mut self, snapshot: &Snapshot) -> CoreResult<()> {
        let frame = encode_frame(SNAPSHOT_MAGIC, &to_cbor(snapshot)?);
        self.snapshot.replace(&frame)?;
        self.wal.truncate(0)?;
        self.commits_since_checkpoint = 0;
        Ok(())
    }

    pub fn wal_size(&self) -> CoreResult<u64> {
        Ok(self.wal.size()?)
    }
}

/// Per-kind record counts of a log, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LogStats {
    /// Size of the write-ahead log in bytes.
    pub wal_bytes: u64,
    /// Size of the snapshot in bytes.
    pub snapshot_bytes: u64,
    /// Nodes in the snapshot.
    pub snapshot_nodes: usize,
    /// Pending changes in the snapshot.
    pub snapshot_pending: usize,
    /// Complete frames in the log.
    pub frames: usize,
    /// `Put` records.
    pub puts: usize,
    /// `Delete` records.
    pub deletes: usize,
    /// `Outbound` records.
    pub outbound: usize,
    /// `Commit` records.
    pub commits: usize,
    /// `Ack` records.
    pub acks: usize,
    /// Whether the log ends in a partial frame.
    pub torn_tail: bool,
}

/// Scans a store's backends without modifying them.
///
/// # Errors
///
/// Returns the same corruption errors recovery would.
pub fn inspect(
    wal: &dyn StorageBackend,
    snapshot: &dyn StorageBackend,
) -> CoreResult<LogStats> {
    let mut stats = LogStats {
        wal_bytes: wal.size()?,
        snapshot_bytes: snapshot.size()?,
        ..LogStats::default()
    };

    let snapshot_bytes = snapshot.read_all()?;
    if let Some(payload) = FrameReader::new(&snapshot_bytes, SNAPSHOT_MAGIC).next_frame()? {
        let snap: Snapshot = from_cbor(payload)?;
        stats.snapshot_nodes = snap.nodes.len();
        stats.snapshot_pending = snap.pending.len();
    }

    let wal_bytes = wal.read_all()?;
    let mut reader = FrameReader::new(&wal_bytes, WAL_MAGIC);
    while let Some(payload) = reader.next_frame()? {
        stats.frames += 1;
        match from_cbor::<LogRecord>(payload)? {
            LogRecord::Put { .. } => stats.puts += 1,
            LogRecord::Delete { .. } => stats.deletes += 1,
            LogRecord::Outbound { .. } => stats.outbound += 1,
            LogRecord::Commit { .. } => stats.commits += 1,
            LogRecord::Ack { .. } => stats.acks += 1,
            LogRecord::Meta { .. } => {}
        }
    }
    stats.torn_tail = reader.torn();
    Ok(stats)
}

/// Builds the snapshot of a store state.
pub(crate) fn snapshot_of(
    replica: ReplicaId,
    clock: u64,
    commit_seq: SequenceNumber,
    nodes: &HashMap<NodeId, NodeRecord>,
    outbound: &OutboundLog,
) -> Snapshot {
    let mut records: Vec<NodeRecord> = nodes.values().cloned().collect();
    records.sort_by(|a, b| (a.created, a.id).cmp(&(b.created, b.id)));
    Snapshot {
        replica,
        clock,
        commit_seq,
        next_outbound: outbound.next_seq(),
        nodes: records,
        pending: outbound.iter().cloned().collect::<Vec<PendingChange>>(),
    }
}
