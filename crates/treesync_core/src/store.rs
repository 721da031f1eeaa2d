//! The local object store.
//!
//! A [`LocalStore`] holds the object table, the pending outbound log and
//! the Lamport clock of one replica. Writes go through a single writer
//! lock; each commit is validated, logged, applied under one table write
//! guard, then published to the change feed and the notification bus
//! before the writer lock is released.

use crate::bus::{BusView, CollectionChange, NotificationBus, ObjectChange, ObserverToken};
use crate::change_feed::{ChangeFeed, ChangeKind, ChangeOrigin, ChangeRecord};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::log::{snapshot_of, LogRecord, StoreLog};
use crate::merge::{merge_records, ConflictKind, ConflictResolved, Winner};
use crate::node::{Node, NodeField, NodeRecord};
use crate::outbound::{OutboundLog, PendingChange, PendingKind};
use crate::query::Predicate;
use crate::types::{LogicalTimestamp, NodeId, OwnerId, ReplicaId, SequenceNumber};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use treesync_storage::{InMemoryBackend, StorageBackend};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Stores whose writer lock is held by this thread.
    static WRITING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn writing(store: u64) -> bool {
    WRITING.with(|w| w.borrow().contains(&store))
}

/// Marks the current thread as the writer of a store until dropped.
struct WriterScope(u64);

impl WriterScope {
    fn enter(store: u64) -> Self {
        WRITING.with(|w| w.borrow_mut().push(store));
        Self(store)
    }
}

impl Drop for WriterScope {
    fn drop(&mut self) {
        WRITING.with(|w| {
            let mut stack = w.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|s| *s == self.0) {
                stack.remove(pos);
            }
        });
    }
}

struct WriteGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    _scope: WriterScope,
}

/// One replicated change, as exchanged with the sync authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Full state of a node.
    Upsert(NodeRecord),
    /// Removal of a node.
    Delete {
        /// Removed node.
        id: NodeId,
        /// Its owner.
        owner_id: OwnerId,
        /// When it was removed.
        at: LogicalTimestamp,
    },
}

impl ChangeOp {
    /// Node the change is about.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        match self {
            ChangeOp::Upsert(record) => record.id,
            ChangeOp::Delete { id, .. } => *id,
        }
    }

    /// Owner of that node.
    #[must_use]
    pub fn owner_id(&self) -> &OwnerId {
        match self {
            ChangeOp::Upsert(record) => &record.owner_id,
            ChangeOp::Delete { owner_id, .. } => owner_id,
        }
    }

    /// Newest logical timestamp carried by the change.
    #[must_use]
    pub fn timestamp(&self) -> LogicalTimestamp {
        match self {
            ChangeOp::Upsert(record) => record.max_timestamp(),
            ChangeOp::Delete { at, .. } => *at,
        }
    }
}

/// Result of [`LocalStore::apply_remote`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Changes that altered the store, with upserts carrying the merged
    /// record.
    pub applied: Vec<ChangeOp>,
    /// Conflicts detected, each reported once.
    pub conflicts: Vec<ConflictResolved>,
}

impl ApplyReport {
    /// Returns true if the batch changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.conflicts.is_empty()
    }
}

struct StoreState {
    nodes: HashMap<NodeId, NodeRecord>,
    outbound: OutboundLog,
    clock: u64,
    commit_seq: SequenceNumber,
    reported: HashSet<(NodeId, ConflictKind, LogicalTimestamp)>,
}

/// A node as seen by a transaction: either committed or staged.
enum Visible<'a> {
    Stored(&'a NodeRecord),
    Staged(&'a Node),
}

impl Visible<'_> {
    fn owner_id(&self) -> &OwnerId {
        match self {
            Visible::Stored(r) => &r.owner_id,
            Visible::Staged(n) => &n.owner_id,
        }
    }

    fn is_root(&self) -> bool {
        match self {
            Visible::Stored(r) => r.is_root,
            Visible::Staged(n) => n.is_root,
        }
    }

    fn references(&self, id: &NodeId) -> bool {
        match self {
            Visible::Stored(r) => r.has_child(id),
            Visible::Staged(n) => n.children.contains(id),
        }
    }
}

fn lookup<'a>(
    nodes: &'a HashMap<NodeId, NodeRecord>,
    overlay: &'a HashMap<NodeId, Option<Node>>,
    id: &NodeId,
) -> Option<Visible<'a>> {
    match overlay.get(id) {
        Some(staged) => staged.as_ref().map(Visible::Staged),
        None => nodes.get(id).map(Visible::Stored),
    }
}

fn visible<'a>(
    nodes: &'a HashMap<NodeId, NodeRecord>,
    overlay: &'a HashMap<NodeId, Option<Node>>,
) -> impl Iterator<Item = (NodeId, Visible<'a>)> + 'a {
    nodes
        .iter()
        .filter(|(id, _)| !overlay.contains_key(*id))
        .map(|(id, r)| (*id, Visible::Stored(r)))
        .chain(
            overlay
                .iter()
                .filter_map(|(id, n)| n.as_ref().map(|n| (*id, Visible::Staged(n)))),
        )
}

/// Checks the post-commit view of a transaction.
fn validate(
    nodes: &HashMap<NodeId, NodeRecord>,
    overlay: &HashMap<NodeId, Option<Node>>,
) -> CoreResult<()> {
    for (id, staged) in overlay {
        let Some(node) = staged else {
            if let Some(record) = nodes.get(id) {
                if let Some(child) = record
                    .child_ids()
                    .into_iter()
                    .find(|c| lookup(nodes, overlay, c).is_some())
                {
                    return Err(CoreError::integrity(format!(
                        "{id} is deleted but its child {child} survives"
                    )));
                }
                if let Some((parent, _)) =
                    visible(nodes, overlay).find(|(_, v)| v.references(id))
                {
                    return Err(CoreError::integrity(format!(
                        "{id} is deleted but still referenced by {parent}"
                    )));
                }
            }
            continue;
        };

        let mut seen = HashSet::new();
        for child in &node.children {
            if child == id {
                return Err(CoreError::integrity(format!("{id} lists itself as a child")));
            }
            if !seen.insert(*child) {
                return Err(CoreError::integrity(format!(
                    "{id} lists child {child} more than once"
                )));
            }
            match lookup(nodes, overlay, child) {
                None => {
                    return Err(CoreError::integrity(format!(
                        "{id} references missing child {child}"
                    )))
                }
                Some(c) if c.owner_id() != &node.owner_id => {
                    return Err(CoreError::integrity(format!(
                        "{id} references child {child} of another owner"
                    )))
                }
                Some(_) => {}
            }
        }

        if node.is_root && !nodes.contains_key(id) {
            let roots = visible(nodes, overlay)
                .filter(|(_, v)| v.is_root() && v.owner_id() == &node.owner_id)
                .count();
            if roots > 1 {
                return Err(CoreError::integrity(format!(
                    "owner {} would have {roots} roots",
                    node.owner_id
                )));
            }
        }
    }
    Ok(())
}

fn stage(
    staged: &mut HashMap<NodeId, Option<NodeRecord>>,
    order: &mut Vec<NodeId>,
    id: NodeId,
    value: Option<NodeRecord>,
) {
    if staged.insert(id, value).is_none() {
        order.push(id);
    }
}

fn diff_fields(before: &NodeRecord, after: &NodeRecord) -> Vec<NodeField> {
    let mut fields = Vec::new();
    if before.text != after.text {
        fields.push(NodeField::Text);
    }
    if before.child_ids() != after.child_ids() {
        fields.push(NodeField::Children);
    }
    fields
}

/// A write transaction.
///
/// Reads see the transaction's own writes. Nothing becomes visible to
/// other readers until the closure passed to [`LocalStore::transaction`]
/// returns `Ok`.
pub struct WriteTxn<'a> {
    state: &'a RwLock<StoreState>,
    overlay: HashMap<NodeId, Option<Node>>,
    order: Vec<NodeId>,
}

impl WriteTxn<'_> {
    /// Reads a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Node> {
        match self.overlay.get(&id) {
            Some(staged) => staged.clone(),
            None => self.state.read_recursive().nodes.get(&id).map(NodeRecord::to_node),
        }
    }

    /// Creates or replaces a node.
    ///
    /// # Errors
    ///
    /// Returns an invalid-operation error if the node has no owner or if it
    /// would change `owner_id` or `is_root` of an existing node.
    pub fn put(&mut self, node: Node) -> CoreResult<()> {
        if node.owner_id.is_empty() {
            return Err(CoreError::invalid_operation("node has no owner"));
        }
        if let Some(existing) = self.get(node.id) {
            if existing.owner_id != node.owner_id {
                return Err(CoreError::invalid_operation(format!(
                    "owner_id of {} is immutable",
                    node.id
                )));
            }
            if existing.is_root != node.is_root {
                return Err(CoreError::invalid_operation(format!(
                    "is_root of {} is immutable",
                    node.id
                )));
            }
        }
        self.stage(node.id, Some(node));
        Ok(())
    }

    /// Deletes a node and every node below it. Returns false if it did
    /// not exist.
    ///
    /// Parents that still list `id` are left alone; the commit fails
    /// unless the caller unlinks it as well.
    pub fn delete(&mut self, id: NodeId) -> bool {
        let Some(node) = self.get(id) else {
            return false;
        };
        let mut seen = HashSet::from([id]);
        let mut stack = node.children;
        self.stage(id, None);
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(child) = self.get(next) {
                stack.extend(child.children);
                self.stage(next, None);
            }
        }
        true
    }

    /// Nodes matching `predicate`: committed ones in creation order, then
    /// the ones created by this transaction.
    #[must_use]
    pub fn query(&self, predicate: &Predicate) -> Vec<Node> {
        let state = self.state.read_recursive();
        let mut stored: Vec<(LogicalTimestamp, NodeId, Node)> = Vec::new();
        for record in state.nodes.values() {
            match self.overlay.get(&record.id) {
                None if predicate.matches(record) => {
                    stored.push((record.created, record.id, record.to_node()));
                }
                Some(Some(node)) if predicate.matches_fields(&node.owner_id, node.is_root) => {
                    stored.push((record.created, record.id, node.clone()));
                }
                _ => {}
            }
        }
        stored.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut result: Vec<Node> = stored.into_iter().map(|(_, _, n)| n).collect();
        for id in &self.order {
            if state.nodes.contains_key(id) {
                continue;
            }
            if let Some(Some(node)) = self.overlay.get(id) {
                if predicate.matches_fields(&node.owner_id, node.is_root) {
                    result.push(node.clone());
                }
            }
        }
        result
    }

    fn stage(&mut self, id: NodeId, value: Option<Node>) {
        if self.overlay.insert(id, value).is_none() {
            self.order.push(id);
        }
    }
}

/// The local object store of one replica.
///
/// # Example
///
/// ```rust,ignore
/// use treesync_core::{LocalStore, Node};
///
/// let store = LocalStore::open_in_memory()?;
/// let root = Node::new_root("alice".into());
/// store.put(root.clone())?;
/// assert_eq!(store.get(root.id)?, Some(root));
/// ```
pub struct LocalStore {
    id: u64,
    config: StoreConfig,
    /// Holds the directory lock. None for in-memory stores.
    dir: Option<StoreDir>,
    log: Mutex<StoreLog>,
    state: RwLock<StoreState>,
    write_lock: Mutex<()>,
    bus: NotificationBus,
    feed: ChangeFeed,
    replica: ReplicaId,
    sealed: AtomicBool,
    closed: AtomicBool,
}

impl LocalStore {
    /// Opens (or creates) a store directory.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another process or its log is
    /// corrupt.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens a store directory with a custom configuration.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::open`].
    pub fn open_with_config(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let (wal, snapshot) = dir.open_backends()?;
        let mut store = Self::open_with_backends(Box::new(wal), Box::new(snapshot), config)?;
        store.dir = Some(dir);
        Ok(store)
    }

    /// Opens a non-persistent store.
    ///
    /// # Errors
    ///
    /// Only fails on codec errors, which an empty store cannot produce.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backends(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            StoreConfig::default(),
        )
    }

    /// Opens a store over the given log and snapshot backends.
    ///
    /// # Errors
    ///
    /// Fails if recovery finds a corrupt log or snapshot.
    pub fn open_with_backends(
        wal: Box<dyn StorageBackend>,
        snapshot: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        let mut log = StoreLog::new(wal, snapshot, config.sync_on_commit);
        let recovered = log.recover()?;

        let replica = match recovered.replica {
            Some(replica) => replica,
            None => {
                let replica = rand::random::<ReplicaId>();
                log.append(&[LogRecord::Meta { replica }])?;
                replica
            }
        };

        let state = StoreState {
            nodes: recovered.nodes,
            outbound: recovered.outbound,
            clock: recovered.clock,
            commit_seq: recovered.commit_seq,
            reported: HashSet::new(),
        };
        if recovered.discarded > 0 {
            // Uncommitted leftovers could share a txid with new commits.
            log.checkpoint(&snapshot_of(
                replica,
                state.clock,
                state.commit_seq,
                &state.nodes,
                &state.outbound,
            ))?;
        }
        info!(
            replica,
            nodes = state.nodes.len(),
            pending = state.outbound.len(),
            replayed = recovered.replayed,
            "opened store"
        );

        Ok(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            feed: ChangeFeed::with_max_history(config.feed_history),
            config,
            dir: None,
            log: Mutex::new(log),
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            bus: NotificationBus::new(),
            replica,
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::StoreClosed)
        } else {
            Ok(())
        }
    }

    fn begin_write(&self, local: bool) -> CoreResult<WriteGuard<'_>> {
        if writing(self.id) {
            return Err(CoreError::ReentrantWrite);
        }
        let lock = self.write_lock.lock();
        self.ensure_open()?;
        if local && self.sealed.load(Ordering::Acquire) {
            return Err(CoreError::StoreSealed);
        }
        Ok(WriteGuard {
            _lock: lock,
            _scope: WriterScope::enter(self.id),
        })
    }

    /// Runs `f` in a write transaction and commits its writes if it
    /// returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error (nothing is written), an integrity
    /// violation, [`CoreError::ReentrantWrite`] when called from a change
    /// notification, or [`CoreError::StoreSealed`] after [`LocalStore::seal`].
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> CoreResult<T>,
    {
        let _guard = self.begin_write(true)?;
        let mut txn = WriteTxn {
            state: &self.state,
            overlay: HashMap::new(),
            order: Vec::new(),
        };
        let value = f(&mut txn)?;
        self.commit_local(txn.overlay, txn.order)?;
        Ok(value)
    }

    fn commit_local(
        &self,
        overlay: HashMap<NodeId, Option<Node>>,
        order: Vec<NodeId>,
    ) -> CoreResult<()> {
        let mut log = self.log.lock();

        let (seq, ts, puts, deletes, pending, changes) = {
            let state = self.state.read();
            if let Err(err) = validate(&state.nodes, &overlay) {
                warn!(error = %err, "rejected commit");
                return Err(err);
            }

            let ts = LogicalTimestamp::new(state.clock + 1, self.replica);
            let seq = state.commit_seq.next();
            let mut next_outbound = state.outbound.next_seq();
            let mut puts = Vec::new();
            let mut deletes = Vec::new();
            let mut pending = Vec::new();
            let mut changes = Vec::new();

            for id in &order {
                let Some(staged) = overlay.get(id) else { continue };
                let (kind, change_kind, owner_id) = match (state.nodes.get(id), staged) {
                    (None, None) => continue,
                    (None, Some(node)) => {
                        puts.push(NodeRecord::created_at(node, ts));
                        (
                            PendingKind::Upsert {
                                created: true,
                                fields: NodeField::ALL.to_vec(),
                                text_base: None,
                            },
                            ChangeKind::Inserted,
                            node.owner_id.clone(),
                        )
                    }
                    (Some(old), Some(node)) => {
                        let (record, fields) = old.updated_at(node, ts);
                        if fields.is_empty() {
                            continue;
                        }
                        let text_base = fields.contains(&NodeField::Text).then_some(old.text_ts);
                        puts.push(record);
                        (
                            PendingKind::Upsert {
                                created: false,
                                fields: fields.clone(),
                                text_base,
                            },
                            ChangeKind::Modified(fields),
                            node.owner_id.clone(),
                        )
                    }
                    (Some(old), None) => {
                        deletes.push(*id);
                        (PendingKind::Delete, ChangeKind::Deleted, old.owner_id.clone())
                    }
                };

                pending.push(PendingChange {
                    seq: next_outbound,
                    node_id: *id,
                    owner_id: owner_id.clone(),
                    kind,
                    committed_at: ts,
                });
                next_outbound = next_outbound.next();
                changes.push(ChangeRecord {
                    seq,
                    node_id: *id,
                    owner_id,
                    kind: change_kind,
                    origin: ChangeOrigin::Local,
                });
            }
            (seq, ts, puts, deletes, pending, changes)
        };

        if changes.is_empty() {
            return Ok(());
        }

        let txid = seq.as_u64();
        let mut records: Vec<LogRecord> = Vec::with_capacity(changes.len() * 2 + 1);
        records.extend(puts.iter().map(|record| LogRecord::Put {
            txid,
            record: record.clone(),
        }));
        records.extend(deletes.iter().map(|id| LogRecord::Delete { txid, id: *id }));
        records.extend(pending.iter().map(|change| LogRecord::Outbound {
            txid,
            change: change.clone(),
        }));
        records.push(LogRecord::Commit {
            txid,
            seq,
            clock: ts.counter,
        });
        log.append(&records)?;

        {
            let mut state = self.state.write();
            for record in puts {
                state.nodes.insert(record.id, record);
            }
            for id in &deletes {
                state.nodes.remove(id);
            }
            for change in pending {
                state.outbound.insert(change);
            }
            state.clock = ts.counter;
            state.commit_seq = seq;
        }
        debug!(seq = %seq, changes = changes.len(), "committed");

        let checkpoint_due = self.config.checkpoint_every > 0
            && log.note_commit() >= self.config.checkpoint_every;
        drop(log);

        self.publish(&changes, &[]);
        if checkpoint_due {
            self.auto_checkpoint();
        }
        Ok(())
    }

    fn publish(&self, changes: &[ChangeRecord], conflicts: &[ConflictResolved]) {
        self.feed.emit_batch(changes);
        let state = self.state.read_recursive();
        self.bus.deliver(changes, conflicts, &state.nodes);
    }

    fn auto_checkpoint(&self) {
        let mut log = self.log.lock();
        if let Err(err) = self.checkpoint_locked(&mut log) {
            warn!(error = %err, "automatic checkpoint failed");
        }
    }

    /// Creates or replaces a node in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::transaction`].
    pub fn put(&self, node: Node) -> CoreResult<()> {
        self.transaction(|txn| txn.put(node))
    }

    /// Deletes a node in its own transaction. Returns false if it did not
    /// exist.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::transaction`].
    pub fn delete(&self, id: NodeId) -> CoreResult<bool> {
        self.transaction(|txn| Ok(txn.delete(id)))
    }

    /// Reads a node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn get(&self, id: NodeId) -> CoreResult<Option<Node>> {
        self.ensure_open()?;
        Ok(self
            .state
            .read_recursive()
            .nodes
            .get(&id)
            .map(NodeRecord::to_node))
    }

    /// Reads a node with its replication metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn record(&self, id: NodeId) -> CoreResult<Option<NodeRecord>> {
        self.ensure_open()?;
        Ok(self.state.read_recursive().nodes.get(&id).cloned())
    }

    /// Nodes matching `predicate`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn query(&self, predicate: &Predicate) -> CoreResult<Vec<Node>> {
        Ok(self
            .records(predicate)?
            .iter()
            .map(NodeRecord::to_node)
            .collect())
    }

    /// Records matching `predicate`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn records(&self, predicate: &Predicate) -> CoreResult<Vec<NodeRecord>> {
        self.ensure_open()?;
        let state = self.state.read_recursive();
        let mut matched: Vec<NodeRecord> = state
            .nodes
            .values()
            .filter(|r| predicate.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (a.created, a.id).cmp(&(b.created, b.id)));
        Ok(matched)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read_recursive().nodes.len()
    }

    /// Returns true if the store holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges changes received from the sync authority.
    ///
    /// Never enqueues outbound changes. Upserts for nodes with a pending
    /// local delete are skipped; a remote delete of a node with pending
    /// local edits wins and is reported as an existence conflict. Child
    /// references left dangling by the batch are pruned.
    ///
    /// # Errors
    ///
    /// Fails on log write errors, [`CoreError::ReentrantWrite`] and
    /// [`CoreError::StoreClosed`]. Sealed stores still accept remote
    /// changes.
    pub fn apply_remote(&self, ops: Vec<ChangeOp>) -> CoreResult<ApplyReport> {
        let _guard = self.begin_write(false)?;
        let mut log = self.log.lock();

        let mut clock;
        let mut staged: HashMap<NodeId, Option<NodeRecord>> = HashMap::new();
        let mut order: Vec<NodeId> = Vec::new();
        let mut deleted_at: HashMap<NodeId, LogicalTimestamp> = HashMap::new();
        let mut conflicts: Vec<ConflictResolved> = Vec::new();
        let mut applied = Vec::new();
        let mut changes = Vec::new();
        let seq;
        {
            let state = self.state.read();
            clock = state.clock;
            seq = state.commit_seq.next();

            for op in ops {
                clock = clock.max(op.timestamp().counter);
                let id = op.node_id();
                let current = match staged.get(&id) {
                    Some(value) => value.clone(),
                    None => state.nodes.get(&id).cloned(),
                };
                match op {
                    ChangeOp::Upsert(remote) => {
                        if state.outbound.deletes(&id) {
                            debug!(node = %id, "skipping remote upsert of locally deleted node");
                            continue;
                        }
                        match current {
                            None => stage(&mut staged, &mut order, id, Some(remote)),
                            Some(local) => {
                                let outcome =
                                    merge_records(&local, &remote, &state.outbound.edits_for(&id));
                                conflicts.extend(outcome.conflicts);
                                if outcome.record != local {
                                    stage(&mut staged, &mut order, id, Some(outcome.record));
                                }
                            }
                        }
                    }
                    ChangeOp::Delete { at, .. } => {
                        let Some(local) = current else { continue };
                        if state.outbound.touches(&id) && !state.outbound.deletes(&id) {
                            conflicts.push(ConflictResolved {
                                node_id: id,
                                kind: ConflictKind::Existence,
                                winner: Winner::Remote,
                                local_ts: local.max_timestamp(),
                                remote_ts: at,
                            });
                        }
                        deleted_at.insert(id, at);
                        stage(&mut staged, &mut order, id, None);
                    }
                }
            }

            let exists = |id: &NodeId| match staged.get(id) {
                Some(value) => value.is_some(),
                None => state.nodes.contains_key(id),
            };
            let mut pruned: Vec<NodeRecord> = Vec::new();
            let staged_records = staged.values().flatten();
            let stored_parents = state
                .nodes
                .values()
                .filter(|r| !staged.contains_key(&r.id))
                .filter(|r| r.children.iter().any(|c| deleted_at.contains_key(&c.id)));
            for record in staged_records.chain(stored_parents) {
                if record.children.iter().any(|c| !exists(&c.id)) {
                    let mut record = record.clone();
                    record.children.retain(|c| exists(&c.id));
                    pruned.push(record);
                }
            }
            for record in pruned {
                stage(&mut staged, &mut order, record.id, Some(record));
            }

            for id in &order {
                let before = state.nodes.get(id);
                let after = staged.get(id).and_then(Option::as_ref);
                let (kind, owner_id) = match (before, after) {
                    (None, None) => continue,
                    (None, Some(after)) => {
                        applied.push(ChangeOp::Upsert(after.clone()));
                        (Some(ChangeKind::Inserted), after.owner_id.clone())
                    }
                    (Some(before), None) => {
                        applied.push(ChangeOp::Delete {
                            id: *id,
                            owner_id: before.owner_id.clone(),
                            at: deleted_at.get(id).copied().unwrap_or(LogicalTimestamp::ZERO),
                        });
                        (Some(ChangeKind::Deleted), before.owner_id.clone())
                    }
                    (Some(before), Some(after)) => {
                        if before == after {
                            continue;
                        }
                        applied.push(ChangeOp::Upsert(after.clone()));
                        let fields = diff_fields(before, after);
                        (
                            (!fields.is_empty()).then(|| ChangeKind::Modified(fields)),
                            after.owner_id.clone(),
                        )
                    }
                };
                if let Some(kind) = kind {
                    changes.push(ChangeRecord {
                        seq,
                        node_id: *id,
                        owner_id,
                        kind,
                        origin: ChangeOrigin::Remote,
                    });
                }
            }
        }

        if !applied.is_empty() {
            let txid = seq.as_u64();
            let mut records: Vec<LogRecord> = applied
                .iter()
                .map(|op| match op {
                    ChangeOp::Upsert(record) => LogRecord::Put {
                        txid,
                        record: record.clone(),
                    },
                    ChangeOp::Delete { id, .. } => LogRecord::Delete { txid, id: *id },
                })
                .collect();
            records.push(LogRecord::Commit { txid, seq, clock });
            log.append(&records)?;
        }

        {
            let mut state = self.state.write();
            state.clock = clock;
            if !applied.is_empty() {
                for op in &applied {
                    match op {
                        ChangeOp::Upsert(record) => {
                            state.nodes.insert(record.id, record.clone());
                        }
                        ChangeOp::Delete { id, .. } => {
                            state.nodes.remove(id);
                        }
                    }
                }
                state.commit_seq = seq;
            }
            conflicts.retain(|c| state.reported.insert((c.node_id, c.kind, c.remote_ts)));
        }

        for conflict in &conflicts {
            info!(
                node = %conflict.node_id,
                kind = ?conflict.kind,
                winner = ?conflict.winner,
                local = %conflict.local_ts,
                remote = %conflict.remote_ts,
                "resolved conflict"
            );
        }
        if !applied.is_empty() {
            debug!(seq = %seq, applied = applied.len(), "applied remote changes");
        }

        let checkpoint_due = !applied.is_empty()
            && self.config.checkpoint_every > 0
            && log.note_commit() >= self.config.checkpoint_every;
        drop(log);

        self.publish(&changes, &conflicts);
        if checkpoint_due {
            self.auto_checkpoint();
        }
        Ok(ApplyReport { applied, conflicts })
    }

    /// Oldest `limit` pending outbound changes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn pending_changes(&self, limit: usize) -> CoreResult<Vec<PendingChange>> {
        self.ensure_open()?;
        Ok(self.state.read_recursive().outbound.oldest(limit))
    }

    /// Number of pending outbound changes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.read_recursive().outbound.len()
    }

    /// Returns true if `id` has unacknowledged local changes.
    #[must_use]
    pub fn has_pending(&self, id: NodeId) -> bool {
        self.state.read_recursive().outbound.touches(&id)
    }

    /// Drops pending changes with `seq <= up_to`. Returns how many were
    /// dropped.
    ///
    /// # Errors
    ///
    /// Fails on log write errors or when called from a notification.
    pub fn acknowledge(&self, up_to: SequenceNumber) -> CoreResult<usize> {
        let _guard = self.begin_write(false)?;
        let count = self
            .state
            .read()
            .outbound
            .iter()
            .take_while(|c| c.seq <= up_to)
            .count();
        if count == 0 {
            return Ok(0);
        }

        self.log.lock().append(&[LogRecord::Ack { up_to }])?;
        let mut state = self.state.write();
        let dropped = state.outbound.acknowledge(up_to);
        let StoreState {
            outbound, reported, ..
        } = &mut *state;
        reported.retain(|(id, _, _)| outbound.touches(id));
        debug!(up_to = %up_to, dropped, "acknowledged outbound changes");
        Ok(dropped)
    }

    /// Refuses further local writes with [`CoreError::StoreSealed`].
    /// Remote changes, acknowledgements and reads are still accepted.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            debug!("store sealed");
        }
    }

    /// Whether [`LocalStore::seal`] was called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Writes a snapshot and truncates the write-ahead log.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or when called from a notification.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let _guard = self.begin_write(false)?;
        let mut log = self.log.lock();
        self.checkpoint_locked(&mut log)
    }

    fn checkpoint_locked(&self, log: &mut StoreLog) -> CoreResult<()> {
        let snapshot = {
            let state = self.state.read();
            snapshot_of(
                self.replica,
                state.clock,
                state.commit_seq,
                &state.nodes,
                &state.outbound,
            )
        };
        log.checkpoint(&snapshot)?;
        info!(
            nodes = snapshot.nodes.len(),
            pending = snapshot.pending.len(),
            seq = %snapshot.commit_seq,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Closes the store. Checkpoints first if configured, then drops every
    /// observer and feed subscriber. Later calls return
    /// [`CoreError::StoreClosed`]; closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint error, if any; the store is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        if writing(self.id) {
            return Err(CoreError::ReentrantWrite);
        }
        let _lock = self.write_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = if self.config.checkpoint_on_close {
            let mut log = self.log.lock();
            self.checkpoint_locked(&mut log)
        } else {
            Ok(())
        };
        self.bus.shutdown();
        self.feed.shutdown();
        info!(replica = self.replica, "store closed");
        result
    }

    /// Whether [`LocalStore::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a collection observer. It fires after every commit that
    /// touched a node matching `predicate` before or after the commit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn observe_collection<F>(&self, predicate: Predicate, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&CollectionChange) + Send + 'static,
    {
        self.ensure_open()?;
        let state = self.state.read_recursive();
        let initial = state.nodes.matching_ids(&predicate);
        self.bus
            .observe_collection(predicate, initial, Box::new(callback))
            .ok_or(CoreError::StoreClosed)
    }

    /// Registers an observer of a single node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn observe_object<F>(&self, id: NodeId, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&ObjectChange) + Send + 'static,
    {
        self.ensure_open()?;
        self.bus
            .observe_object(id, Box::new(callback))
            .ok_or(CoreError::StoreClosed)
    }

    /// Registers an observer of resolved conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StoreClosed`] after close.
    pub fn observe_conflicts<F>(&self, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&ConflictResolved) + Send + 'static,
    {
        self.ensure_open()?;
        self.bus
            .observe_conflicts(Box::new(callback))
            .ok_or(CoreError::StoreClosed)
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn unobserve(&self, token: ObserverToken) -> bool {
        self.bus.unobserve(token)
    }

    /// The change feed of committed changes.
    #[must_use]
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Replica id used in this store's logical timestamps.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current Lamport counter.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.state.read_recursive().clock
    }

    /// Sequence number of the latest commit.
    #[must_use]
    pub fn committed_seq(&self) -> SequenceNumber {
        self.state.read_recursive().commit_seq
    }

    /// Store directory, for persistent stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Current size of the write-ahead log in bytes.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.log.lock().wal_size()
    }

    /// The configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
