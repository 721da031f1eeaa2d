//! Deterministic merge of concurrent node versions.
//!
//! * `text` is last-writer-wins on its [`LogicalTimestamp`].
//! * `children` keeps the common prefix of both lists, then appends the
//!   union of the remaining references ordered by `(added, id)`. No
//!   reference either side added is dropped.
//! * `owner_id`, `is_root` and the creation stamp never change.
//!
//! Merging a record with an identical copy of itself is a no-op.

use crate::node::{ChildRef, NodeField, NodeRecord};
use crate::types::{LogicalTimestamp, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a conflict was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Concurrent writes to `text`.
    Text,
    /// Concurrent appends to `children`.
    Children,
    /// A local update raced with a remote delete.
    Existence,
}

/// Which side's value survived a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Winner {
    /// The local value was kept.
    Local,
    /// The remote value replaced the local one.
    Remote,
    /// Both sides were combined.
    Merged,
}

/// Notification that a conflict was detected and resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolved {
    /// The node concerned.
    pub node_id: NodeId,
    /// The conflicting field or existence.
    pub kind: ConflictKind,
    /// Outcome.
    pub winner: Winner,
    /// Timestamp of the local write.
    pub local_ts: LogicalTimestamp,
    /// Timestamp of the remote write.
    pub remote_ts: LogicalTimestamp,
}

/// Unacknowledged local edits to one node, used to tell concurrent writes
/// from plain catch-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingEdits {
    /// `text_ts` the oldest pending text edit was based on.
    pub text_base: Option<LogicalTimestamp>,
    /// Whether a pending edit touched `children`.
    pub children: bool,
    /// Whether any pending change exists for the node.
    pub any: bool,
}

/// Result of [`merge_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged record.
    pub record: NodeRecord,
    /// Fields whose caller-visible value differs from the local record.
    pub changed: Vec<NodeField>,
    /// Conflicts detected while merging.
    pub conflicts: Vec<ConflictResolved>,
}

impl MergeOutcome {
    /// Returns true if the merge left the local record untouched.
    #[must_use]
    pub fn is_noop(&self, local: &NodeRecord) -> bool {
        self.record == *local
    }
}

/// Merges a remote version of a node into the local one.
///
/// `edits` describes local changes the remote side has not acknowledged
/// yet; conflicts are only reported against those.
#[must_use]
pub fn merge_records(
    local: &NodeRecord,
    remote: &NodeRecord,
    edits: &PendingEdits,
) -> MergeOutcome {
    let mut record = local.clone();
    let mut changed = Vec::new();
    let mut conflicts = Vec::new();

    if remote.text_ts > local.text_ts {
        if remote.text != local.text {
            changed.push(NodeField::Text);
        }
        record.text = remote.text.clone();
        record.text_ts = remote.text_ts;
    }
    if let Some(base) = edits.text_base {
        if remote.text_ts > base && remote.text_ts != local.text_ts && remote.text != local.text
        {
            conflicts.push(ConflictResolved {
                node_id: local.id,
                kind: ConflictKind::Text,
                winner: if remote.text_ts > local.text_ts {
                    Winner::Remote
                } else {
                    Winner::Local
                },
                local_ts: local.text_ts,
                remote_ts: remote.text_ts,
            });
        }
    }

    let (children, remote_added) = merge_children(&local.children, &remote.children);
    if !remote_added.is_empty() {
        if edits.children {
            conflicts.push(ConflictResolved {
                node_id: local.id,
                kind: ConflictKind::Children,
                winner: Winner::Merged,
                local_ts: newest(&local.children),
                remote_ts: newest(&remote_added),
            });
        }
        changed.push(NodeField::Children);
        record.children = children;
    }

    MergeOutcome {
        record,
        changed,
        conflicts,
    }
}

fn newest(refs: &[ChildRef]) -> LogicalTimestamp {
    refs.iter()
        .map(|c| c.added)
        .max()
        .unwrap_or(LogicalTimestamp::ZERO)
}

/// Returns the merged list and the references only the remote side had.
fn merge_children(local: &[ChildRef], remote: &[ChildRef]) -> (Vec<ChildRef>, Vec<ChildRef>) {
    let prefix = local
        .iter()
        .zip(remote)
        .take_while(|(l, r)| l.id == r.id)
        .count();

    let known: HashSet<NodeId> = local.iter().map(|c| c.id).collect();
    let remote_added: Vec<ChildRef> = remote[prefix..]
        .iter()
        .filter(|c| !known.contains(&c.id))
        .copied()
        .collect();
    if remote_added.is_empty() {
        return (local.to_vec(), remote_added);
    }

    let mut tail: Vec<ChildRef> = local[prefix..].to_vec();
    tail.extend(remote_added.iter().copied());
    tail.sort_by(|a, b| (a.added, a.id).cmp(&(b.added, b.id)));

    let mut merged = local[..prefix].to_vec();
    merged.extend(tail);
    (merged, remote_added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use proptest::prelude::*;

    fn ts(counter: u64, replica: u32) -> LogicalTimestamp {
        LogicalTimestamp::new(counter, replica)
    }

    fn record(text: &str, at: LogicalTimestamp) -> NodeRecord {
        NodeRecord::created_at(&Node::new_child("alice".into(), text), at)
    }

    fn child(at: LogicalTimestamp) -> ChildRef {
        ChildRef {
            id: NodeId::new(),
            added: at,
        }
    }

    #[test]
    fn identical_copy_is_noop() {
        let local = record("same", ts(3, 1));
        let outcome = merge_records(&local, &local.clone(), &PendingEdits::default());
        assert!(outcome.is_noop(&local));
        assert!(outcome.changed.is_empty());
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn newer_remote_text_wins_without_conflict_when_nothing_pending() {
        let local = record("old", ts(1, 1));
        let mut remote = local.clone();
        remote.text = "new".into();
        remote.text_ts = ts(5, 2);

        let outcome = merge_records(&local, &remote, &PendingEdits::default());
        assert_eq!(outcome.record.text, "new");
        assert_eq!(outcome.record.text_ts, ts(5, 2));
        assert_eq!(outcome.changed, vec![NodeField::Text]);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn stale_remote_text_is_ignored() {
        let mut local = record("fresh", ts(1, 1));
        local.text_ts = ts(9, 1);
        let mut remote = local.clone();
        remote.text = "stale".into();
        remote.text_ts = ts(4, 2);

        let outcome = merge_records(&local, &remote, &PendingEdits::default());
        assert!(outcome.is_noop(&local));
    }

    #[test]
    fn concurrent_text_edit_reports_one_conflict() {
        let base = ts(2, 1);
        let mut local = record("base", ts(1, 1));
        local.text = "mine".into();
        local.text_ts = ts(6, 1);
        let mut remote = local.clone();
        remote.text = "theirs".into();
        remote.text_ts = ts(7, 2);

        let edits = PendingEdits {
            text_base: Some(base),
            children: false,
            any: true,
        };
        let outcome = merge_records(&local, &remote, &edits);
        assert_eq!(outcome.record.text, "theirs");
        assert_eq!(outcome.conflicts.len(), 1);
        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::Text);
        assert_eq!(conflict.winner, Winner::Remote);
        assert_eq!(conflict.local_ts, ts(6, 1));
        assert_eq!(conflict.remote_ts, ts(7, 2));
    }

    #[test]
    fn local_wins_when_later() {
        let mut local = record("base", ts(1, 1));
        local.text = "mine".into();
        local.text_ts = ts(8, 1);
        let mut remote = local.clone();
        remote.text = "theirs".into();
        remote.text_ts = ts(7, 2);

        let edits = PendingEdits {
            text_base: Some(ts(1, 1)),
            ..PendingEdits::default()
        };
        let outcome = merge_records(&local, &remote, &edits);
        assert_eq!(outcome.record.text, "mine");
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.conflicts[0].winner, Winner::Local);
    }

    #[test]
    fn echo_of_the_base_is_not_a_conflict() {
        let mut local = record("base", ts(2, 1));
        local.text = "edited".into();
        local.text_ts = ts(5, 1);
        let remote = record("base", ts(2, 1));
        let remote = NodeRecord {
            id: local.id,
            ..remote
        };

        let edits = PendingEdits {
            text_base: Some(ts(2, 1)),
            ..PendingEdits::default()
        };
        let outcome = merge_records(&local, &remote, &edits);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.record.text, "edited");
    }

    #[test]
    fn concurrent_appends_keep_both_sides_in_timestamp_order() {
        let shared = child(ts(1, 1));
        let mine = child(ts(4, 1));
        let theirs = child(ts(3, 2));

        let mut local = record("parent", ts(1, 1));
        local.children = vec![shared, mine];
        let mut remote = local.clone();
        remote.children = vec![shared, theirs];

        let edits = PendingEdits {
            children: true,
            any: true,
            ..PendingEdits::default()
        };
        let outcome = merge_records(&local, &remote, &edits);
        let ids: Vec<NodeId> = outcome.record.children.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![shared.id, theirs.id, mine.id]);
        assert_eq!(outcome.changed, vec![NodeField::Children]);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::Children);
        assert_eq!(outcome.conflicts[0].winner, Winner::Merged);
    }

    #[test]
    fn stale_shorter_list_keeps_local_order() {
        let a = child(ts(1, 1));
        let b = child(ts(2, 1));
        let mut local = record("parent", ts(1, 1));
        local.children = vec![a, b];
        let mut remote = local.clone();
        remote.children = vec![a];

        let outcome = merge_records(&local, &remote, &PendingEdits::default());
        assert!(outcome.is_noop(&local));
    }

    #[test]
    fn immutable_fields_stay_local() {
        let local = record("x", ts(1, 1));
        let mut remote = local.clone();
        remote.owner_id = "mallory".into();
        remote.is_root = true;
        remote.created = ts(0, 9);

        let outcome = merge_records(&local, &remote, &PendingEdits::default());
        assert_eq!(outcome.record.owner_id, local.owner_id);
        assert!(!outcome.record.is_root);
        assert_eq!(outcome.record.created, local.created);
    }

    fn arb_children() -> impl Strategy<Value = Vec<(u64, u32)>> {
        prop::collection::vec((0u64..20, 0u32..3), 0..6)
    }

    fn build(layout: &[(u64, u32)]) -> Vec<ChildRef> {
        layout.iter().map(|&(c, r)| child(ts(c, r))).collect()
    }

    proptest! {
        #[test]
        fn merge_never_drops_a_reference(
            shared in arb_children(),
            left in arb_children(),
            right in arb_children(),
        ) {
            let shared = build(&shared);
            let mut local = record("p", ts(1, 1));
            local.children = shared.iter().copied().chain(build(&left)).collect();
            let mut remote = local.clone();
            remote.children = shared.iter().copied().chain(build(&right)).collect();

            let outcome = merge_records(&local, &remote, &PendingEdits::default());
            let merged: HashSet<NodeId> = outcome.record.children.iter().map(|c| c.id).collect();
            for c in local.children.iter().chain(&remote.children) {
                prop_assert!(merged.contains(&c.id));
            }
            prop_assert_eq!(merged.len(), outcome.record.children.len());
            for (m, s) in outcome.record.children.iter().zip(&shared) {
                prop_assert_eq!(m.id, s.id);
            }
        }

        #[test]
        fn merge_with_self_is_noop(layout in arb_children(), counter in 1u64..50) {
            let mut local = record("p", ts(counter, 1));
            local.children = build(&layout);
            let outcome = merge_records(&local, &local.clone(), &PendingEdits::default());
            prop_assert!(outcome.is_noop(&local));
            prop_assert!(outcome.changed.is_empty());
        }
    }
}
