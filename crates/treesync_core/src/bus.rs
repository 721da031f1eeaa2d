//! In-process change notifications.
//!
//! Observers are keyed by node id, by predicate, or listen for conflict
//! resolutions. The store delivers after every commit, on the committing
//! thread and before the next commit is accepted.
//!
//! Delivery takes the observer list out of the registry for the duration
//! of the pass. Registrations made meanwhile are queued and join after the
//! pass; [`NotificationBus::unobserve`] during a pass marks the observer so
//! it is skipped for the rest of the pass and dropped at its end.

use crate::change_feed::{ChangeKind, ChangeRecord};
use crate::merge::ConflictResolved;
use crate::node::{Node, NodeField, NodeRecord};
use crate::query::Predicate;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

/// Diff of a collection result since the previous delivery.
///
/// Results are ordered by creation. `deletions` index into the previous
/// result; `insertions` and `modifications` index into the new one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionChange {
    /// Size of the new result.
    pub count: usize,
    /// Positions of nodes that entered the result.
    pub insertions: Vec<usize>,
    /// Positions (in the previous result) of nodes that left it.
    pub deletions: Vec<usize>,
    /// Positions of nodes that stayed and changed.
    pub modifications: Vec<usize>,
}

impl CollectionChange {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
    }
}

/// Change to a single observed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    /// The node.
    pub node_id: NodeId,
    /// Its state after the commit, if it still exists.
    pub node: Option<Node>,
    /// Fields that changed.
    pub changed_fields: Vec<NodeField>,
    /// Whether the commit deleted the node.
    pub deleted: bool,
}

type CollectionCallback = Box<dyn FnMut(&CollectionChange) + Send>;
type ObjectCallback = Box<dyn FnMut(&ObjectChange) + Send>;
type ConflictCallback = Box<dyn FnMut(&ConflictResolved) + Send>;

enum Observer {
    Collection {
        predicate: Predicate,
        last: Vec<NodeId>,
        callback: CollectionCallback,
    },
    Object {
        node_id: NodeId,
        callback: ObjectCallback,
    },
    Conflict {
        callback: ConflictCallback,
    },
}

struct Entry {
    token: ObserverToken,
    observer: Observer,
}

enum Event {
    Collection(CollectionChange),
    Object(ObjectChange),
    Conflicts(Vec<ConflictResolved>),
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    live: HashSet<ObserverToken>,
    delivering: bool,
    pending_add: Vec<Entry>,
    pending_remove: HashSet<ObserverToken>,
    closed: bool,
}

/// Read access to committed state used while computing events.
pub(crate) trait BusView {
    /// Ids matching `predicate`, in creation order.
    fn matching_ids(&self, predicate: &Predicate) -> Vec<NodeId>;
    /// Current state of `id`.
    fn node(&self, id: &NodeId) -> Option<Node>;
}

impl BusView for HashMap<NodeId, NodeRecord> {
    fn matching_ids(&self, predicate: &Predicate) -> Vec<NodeId> {
        let mut matched: Vec<&NodeRecord> = self.values().filter(|r| predicate.matches(r)).collect();
        matched.sort_by(|a, b| (a.created, a.id).cmp(&(b.created, b.id)));
        matched.into_iter().map(|r| r.id).collect()
    }

    fn node(&self, id: &NodeId) -> Option<Node> {
        self.get(id).map(NodeRecord::to_node)
    }
}

/// Registry and dispatcher of change observers.
pub struct NotificationBus {
    registry: Mutex<Registry>,
    next_token: AtomicU64,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn observe_collection(
        &self,
        predicate: Predicate,
        initial: Vec<NodeId>,
        callback: CollectionCallback,
    ) -> Option<ObserverToken> {
        self.register(Observer::Collection {
            predicate,
            last: initial,
            callback,
        })
    }

    pub(crate) fn observe_object(
        &self,
        node_id: NodeId,
        callback: ObjectCallback,
    ) -> Option<ObserverToken> {
        self.register(Observer::Object { node_id, callback })
    }

    pub(crate) fn observe_conflicts(&self, callback: ConflictCallback) -> Option<ObserverToken> {
        self.register(Observer::Conflict { callback })
    }

    fn register(&self, observer: Observer) -> Option<ObserverToken> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return None;
        }
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        registry.live.insert(token);
        let entry = Entry { token, observer };
        if registry.delivering {
            registry.pending_add.push(entry);
        } else {
            registry.entries.push(entry);
        }
        Some(token)
    }

    /// Removes an observer. Safe to call from inside a callback, in which
    /// case removal takes effect immediately for delivery purposes and the
    /// entry is dropped when the current pass ends.
    ///
    /// Returns false if the token was not registered.
    pub fn unobserve(&self, token: ObserverToken) -> bool {
        let dropped;
        {
            let mut registry = self.registry.lock();
            if !registry.live.remove(&token) {
                return false;
            }
            if registry.delivering {
                registry.pending_remove.insert(token);
                let (removed, kept): (Vec<Entry>, Vec<Entry>) =
                    mem::take(&mut registry.pending_add)
                        .into_iter()
                        .partition(|e| e.token == token);
                registry.pending_add = kept;
                dropped = removed;
            } else {
                let (removed, kept): (Vec<Entry>, Vec<Entry>) =
                    mem::take(&mut registry.entries)
                        .into_iter()
                        .partition(|e| e.token == token);
                registry.entries = kept;
                dropped = removed;
            }
        }
        drop(dropped);
        true
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.registry.lock().live.len()
    }

    /// Whether [`NotificationBus::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().closed
    }

    /// Drops every observer. No callback runs after this returns, unless
    /// it was already running on another thread.
    pub fn shutdown(&self) {
        let (entries, pending) = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.live.clear();
            registry.pending_remove.clear();
            (
                mem::take(&mut registry.entries),
                mem::take(&mut registry.pending_add),
            )
        };
        drop(entries);
        drop(pending);
    }

    /// Delivers one commit.
    pub(crate) fn deliver(
        &self,
        changes: &[ChangeRecord],
        conflicts: &[ConflictResolved],
        view: &dyn BusView,
    ) {
        if changes.is_empty() && conflicts.is_empty() {
            return;
        }

        let mut entries = {
            let mut registry = self.registry.lock();
            if registry.closed || registry.entries.is_empty() {
                return;
            }
            registry.delivering = true;
            mem::take(&mut registry.entries)
        };

        let events: Vec<Option<Event>> = entries
            .iter_mut()
            .map(|entry| event_for(&mut entry.observer, changes, conflicts, view))
            .collect();

        for (entry, event) in entries.iter_mut().zip(events) {
            let Some(event) = event else { continue };
            {
                let registry = self.registry.lock();
                if registry.closed || registry.pending_remove.contains(&entry.token) {
                    continue;
                }
            }
            match (&mut entry.observer, event) {
                (Observer::Collection { callback, .. }, Event::Collection(change)) => {
                    callback(&change);
                }
                (Observer::Object { callback, .. }, Event::Object(change)) => callback(&change),
                (Observer::Conflict { callback }, Event::Conflicts(list)) => {
                    for conflict in &list {
                        callback(conflict);
                    }
                }
                _ => {}
            }
        }

        let leftovers = {
            let mut registry = self.registry.lock();
            registry.delivering = false;
            if registry.closed {
                registry.pending_add.clear();
                entries
            } else {
                let removed = mem::take(&mut registry.pending_remove);
                let added = mem::take(&mut registry.pending_add);
                let (gone, mut kept): (Vec<Entry>, Vec<Entry>) = entries
                    .into_iter()
                    .partition(|e| removed.contains(&e.token));
                kept.extend(added);
                registry.entries = kept;
                gone
            }
        };
        drop(leftovers);
    }
}

fn event_for(
    observer: &mut Observer,
    changes: &[ChangeRecord],
    conflicts: &[ConflictResolved],
    view: &dyn BusView,
) -> Option<Event> {
    match observer {
        Observer::Collection {
            predicate, last, ..
        } => {
            let previous: HashSet<NodeId> = last.iter().copied().collect();
            let current = view.matching_ids(predicate);
            let now: HashSet<NodeId> = current.iter().copied().collect();
            let relevant = changes
                .iter()
                .any(|c| previous.contains(&c.node_id) || now.contains(&c.node_id));
            if !relevant {
                return None;
            }

            let modified: HashSet<NodeId> = changes
                .iter()
                .filter(|c| matches!(c.kind, ChangeKind::Modified(_)))
                .map(|c| c.node_id)
                .collect();
            let change = CollectionChange {
                count: current.len(),
                insertions: positions(&current, |id| !previous.contains(id)),
                deletions: positions(last, |id| !now.contains(id)),
                modifications: positions(&current, |id| {
                    previous.contains(id) && modified.contains(id)
                }),
            };
            *last = current;
            (!change.is_empty()).then_some(Event::Collection(change))
        }
        Observer::Object { node_id, .. } => {
            let mut touched = false;
            let mut deleted = false;
            let mut fields: Vec<NodeField> = Vec::new();
            for change in changes.iter().filter(|c| c.node_id == *node_id) {
                touched = true;
                match &change.kind {
                    ChangeKind::Inserted => {
                        deleted = false;
                        fields = NodeField::ALL.to_vec();
                    }
                    ChangeKind::Modified(changed) => {
                        deleted = false;
                        for field in changed {
                            if !fields.contains(field) {
                                fields.push(*field);
                            }
                        }
                    }
                    ChangeKind::Deleted => deleted = true,
                }
            }
            if !touched {
                return None;
            }
            fields.sort();
            Some(Event::Object(ObjectChange {
                node_id: *node_id,
                node: view.node(node_id),
                changed_fields: fields,
                deleted,
            }))
        }
        Observer::Conflict { .. } => {
            (!conflicts.is_empty()).then(|| Event::Conflicts(conflicts.to_vec()))
        }
    }
}

fn positions(ids: &[NodeId], keep: impl Fn(&NodeId) -> bool) -> Vec<usize> {
    ids.iter()
        .enumerate()
        .filter(|(_, id)| keep(id))
        .map(|(i, _)| i)
        .collect()
}
