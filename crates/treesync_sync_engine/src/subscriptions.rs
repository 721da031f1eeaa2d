//! Subscription manager.
//!
//! Holds the predicates a connection replicates. Every predicate is
//! implicitly confined to the connection's principal; the authority applies
//! the same restriction on its side.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::Notify;
use tracing::debug;
use treesync_core::{NodeRecord, OwnerId, Predicate};

/// Identifies one subscription of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug)]
struct Inner {
    entries: Vec<(SubscriptionId, Predicate)>,
    next_id: u64,
    version: u64,
}

/// The set of predicates a connection replicates.
///
/// The bootstrap predicate `owner_id == principal` is installed on
/// creation and cannot be removed.
#[derive(Debug)]
pub struct SubscriptionManager {
    principal: OwnerId,
    bootstrap: SubscriptionId,
    inner: Mutex<Inner>,
    changed: Notify,
}

impl SubscriptionManager {
    /// Creates the manager for `principal` with its bootstrap subscription.
    pub fn new(principal: OwnerId) -> Self {
        let bootstrap = SubscriptionId(1);
        Self {
            inner: Mutex::new(Inner {
                entries: vec![(bootstrap, Predicate::owned_by(&principal))],
                next_id: 2,
                version: 1,
            }),
            principal,
            bootstrap,
            changed: Notify::new(),
        }
    }

    /// Adds `predicate`. Adding a predicate that is already present
    /// returns its existing id and changes nothing.
    pub fn add(&self, predicate: Predicate) -> SubscriptionId {
        let mut inner = self.inner.lock();
        if let Some((id, _)) = inner.entries.iter().find(|(_, p)| *p == predicate) {
            return *id;
        }
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.version += 1;
        debug!(subscription = %id, predicate = %predicate, "subscription added");
        inner.entries.push((id, predicate));
        drop(inner);
        self.changed.notify_one();
        id
    }

    /// Removes a subscription. Returns false for unknown ids and for the
    /// bootstrap subscription.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        if id == self.bootstrap {
            return false;
        }
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry, _)| *entry != id);
        if inner.entries.len() == before {
            return false;
        }
        inner.version += 1;
        drop(inner);
        debug!(subscription = %id, "subscription removed");
        self.changed.notify_one();
        true
    }

    /// Current predicates in subscription order.
    pub fn predicates(&self) -> Vec<Predicate> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Current subscriptions.
    pub fn entries(&self) -> Vec<(SubscriptionId, Predicate)> {
        self.inner.lock().entries.clone()
    }

    /// Returns true if `record` is replicated by this connection.
    pub fn contains(&self, record: &NodeRecord) -> bool {
        record.owner_id == self.principal
            && self.inner.lock().entries.iter().any(|(_, p)| p.matches(record))
    }

    /// Id of the bootstrap subscription.
    pub fn bootstrap(&self) -> SubscriptionId {
        self.bootstrap
    }

    /// Principal every subscription is confined to.
    pub fn principal(&self) -> &OwnerId {
        &self.principal
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Counter bumped by every effective add or remove.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Predicates confined to the principal, with the version they belong
    /// to.
    pub(crate) fn confined(&self) -> (Vec<Predicate>, u64) {
        let inner = self.inner.lock();
        let predicates = inner
            .entries
            .iter()
            .map(|(_, p)| {
                if p.confined_to(&self.principal) {
                    p.clone()
                } else {
                    p.clone().and(Predicate::owned_by(&self.principal))
                }
            })
            .collect();
        (predicates, inner.version)
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }
}
