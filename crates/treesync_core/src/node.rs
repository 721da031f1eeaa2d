//! The node entity and its replicated record form.

use crate::types::{LogicalTimestamp, NodeId, OwnerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A tree node as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Immutable identifier.
    pub id: NodeId,
    /// Owning principal, set once at creation.
    pub owner_id: OwnerId,
    /// Whether this is the owner's root node.
    pub is_root: bool,
    /// Text payload.
    pub text: String,
    /// Ordered child references. Children are owned by this node.
    pub children: Vec<NodeId>,
}

impl Node {
    /// Builds a fresh root node for `owner`.
    #[must_use]
    pub fn new_root(owner: OwnerId) -> Self {
        Self {
            id: NodeId::new(),
            owner_id: owner,
            is_root: true,
            text: "root".to_string(),
            children: Vec::new(),
        }
    }

    /// Builds a fresh non-root node for `owner`.
    #[must_use]
    pub fn new_child(owner: OwnerId, text: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            owner_id: owner,
            is_root: false,
            text: text.into(),
            children: Vec::new(),
        }
    }
}

/// Names of the fields of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeField {
    /// `owner_id`
    OwnerId,
    /// `is_root`
    IsRoot,
    /// `text`
    Text,
    /// `children`
    Children,
}

impl NodeField {
    /// Every field, in declaration order.
    pub const ALL: [NodeField; 4] = [
        NodeField::OwnerId,
        NodeField::IsRoot,
        NodeField::Text,
        NodeField::Children,
    ];

    /// Field name as used in the data model.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            NodeField::OwnerId => "owner_id",
            NodeField::IsRoot => "is_root",
            NodeField::Text => "text",
            NodeField::Children => "children",
        }
    }
}

impl fmt::Display for NodeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A child reference together with the time it was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildRef {
    /// The referenced child.
    pub id: NodeId,
    /// When the reference was added to the list.
    pub added: LogicalTimestamp,
}

/// A node plus the replication metadata merges need.
///
/// This is what the local store persists and what the sync protocol
/// carries; callers see the plain [`Node`] projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier.
    pub id: NodeId,
    /// Owning principal.
    pub owner_id: OwnerId,
    /// Root flag.
    pub is_root: bool,
    /// Text payload.
    pub text: String,
    /// Timestamp of the last write to `text`.
    pub text_ts: LogicalTimestamp,
    /// Creation timestamp; also the collection ordering key.
    pub created: LogicalTimestamp,
    /// Ordered children with their append timestamps.
    pub children: Vec<ChildRef>,
}

impl NodeRecord {
    /// Builds the record for a node created by a commit at `ts`.
    #[must_use]
    pub fn created_at(node: &Node, ts: LogicalTimestamp) -> Self {
        Self {
            id: node.id,
            owner_id: node.owner_id.clone(),
            is_root: node.is_root,
            text: node.text.clone(),
            text_ts: ts,
            created: ts,
            children: node
                .children
                .iter()
                .map(|&id| ChildRef { id, added: ts })
                .collect(),
        }
    }

    /// Applies a local whole-node write committed at `ts`.
    ///
    /// Returns the updated record and the fields whose value changed.
    /// Children that were already present keep their append timestamp.
    /// `owner_id` and `is_root` are not touched here; the store rejects
    /// writes that try to change them before this is called.
    #[must_use]
    pub fn updated_at(&self, node: &Node, ts: LogicalTimestamp) -> (Self, Vec<NodeField>) {
        let mut next = self.clone();
        let mut changed = Vec::new();

        if node.text != self.text {
            next.text = node.text.clone();
            next.text_ts = ts;
            changed.push(NodeField::Text);
        }

        if node.children != self.child_ids() {
            let known: HashMap<NodeId, LogicalTimestamp> =
                self.children.iter().map(|c| (c.id, c.added)).collect();
            next.children = node
                .children
                .iter()
                .map(|&id| ChildRef {
                    id,
                    added: known.get(&id).copied().unwrap_or(ts),
                })
                .collect();
            changed.push(NodeField::Children);
        }

        (next, changed)
    }

    /// Child identifiers in list order.
    #[must_use]
    pub fn child_ids(&self) -> Vec<NodeId> {
        self.children.iter().map(|c| c.id).collect()
    }

    /// Returns true if `id` is one of this node's children.
    #[must_use]
    pub fn has_child(&self, id: &NodeId) -> bool {
        self.children.iter().any(|c| c.id == *id)
    }

    /// The caller-facing projection.
    #[must_use]
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id,
            owner_id: self.owner_id.clone(),
            is_root: self.is_root,
            text: self.text.clone(),
            children: self.child_ids(),
        }
    }

    /// Newest timestamp mentioned anywhere in the record.
    #[must_use]
    pub fn max_timestamp(&self) -> LogicalTimestamp {
        self.children
            .iter()
            .map(|c| c.added)
            .chain([self.text_ts, self.created])
            .max()
            .unwrap_or(LogicalTimestamp::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(counter: u64) -> LogicalTimestamp {
        LogicalTimestamp::new(counter, 1)
    }

    #[test]
    fn new_root_has_default_shape() {
        let root = Node::new_root("alice".into());
        assert!(root.is_root);
        assert_eq!(root.text, "root");
        assert!(root.children.is_empty());
    }

    #[test]
    fn created_record_stamps_every_field() {
        let child = NodeId::new();
        let mut node = Node::new_child("alice".into(), "hello");
        node.children.push(child);

        let record = NodeRecord::created_at(&node, ts(4));
        assert_eq!(record.created, ts(4));
        assert_eq!(record.text_ts, ts(4));
        assert_eq!(record.children, vec![ChildRef { id: child, added: ts(4) }]);
        assert_eq!(record.to_node(), node);
    }

    #[test]
    fn update_keeps_existing_child_timestamps() {
        let a = NodeId::new();
        let b = NodeId::new();
        let mut node = Node::new_root("alice".into());
        node.children.push(a);
        let record = NodeRecord::created_at(&node, ts(1));

        node.children.push(b);
        let (next, changed) = record.updated_at(&node, ts(2));
        assert_eq!(changed, vec![NodeField::Children]);
        assert_eq!(next.children[0].added, ts(1));
        assert_eq!(next.children[1].added, ts(2));
        assert_eq!(next.text_ts, ts(1));
    }

    #[test]
    fn unchanged_write_reports_no_fields() {
        let node = Node::new_child("alice".into(), "same");
        let record = NodeRecord::created_at(&node, ts(1));
        let (next, changed) = record.updated_at(&node, ts(9));
        assert!(changed.is_empty());
        assert_eq!(next, record);
    }

    #[test]
    fn text_update_moves_text_timestamp() {
        let mut node = Node::new_child("alice".into(), "before");
        let record = NodeRecord::created_at(&node, ts(1));
        node.text = "after".into();
        let (next, changed) = record.updated_at(&node, ts(3));
        assert_eq!(changed, vec![NodeField::Text]);
        assert_eq!(next.text_ts, ts(3));
        assert_eq!(next.created, ts(1));
        assert_eq!(next.max_timestamp(), ts(3));
    }
}
