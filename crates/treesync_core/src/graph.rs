//! Owner-scoped tree operations on top of the local store.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::query::Predicate;
use crate::store::LocalStore;
use crate::types::{NodeId, OwnerId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A node and its depth below the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// 1 for direct children of the root.
    pub depth: usize,
    /// The node.
    pub node: Node,
}

/// An owner's tree in depth-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeView {
    /// The root.
    pub root: Node,
    /// Every descendant, parents before children.
    pub entries: Vec<TreeEntry>,
}

/// Summary of an owner's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerInfo {
    /// The owner.
    pub owner: OwnerId,
    /// Root id, if the root exists.
    pub root_id: Option<NodeId>,
    /// Number of nodes the owner has.
    pub total_nodes: usize,
    /// Number of direct children of the root.
    pub root_children: usize,
}

/// Tree operations bound to a store.
pub struct NodeGraph {
    store: Arc<LocalStore>,
    roots: Mutex<HashMap<OwnerId, NodeId>>,
    owner_locks: Mutex<HashMap<OwnerId, Arc<Mutex<()>>>>,
}

fn require_owner(owner: &OwnerId) -> CoreResult<()> {
    if owner.is_empty() {
        Err(CoreError::NotAuthenticated)
    } else {
        Ok(())
    }
}

impl NodeGraph {
    /// Creates a graph over `store`.
    #[must_use]
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            roots: Mutex::new(HashMap::new()),
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    fn owner_lock(&self, owner: &OwnerId) -> Arc<Mutex<()>> {
        self.owner_locks
            .lock()
            .entry(owner.clone())
            .or_default()
            .clone()
    }

    /// The owner's first root by creation time, with the cache brought in
    /// line with it. A root that arrives from another replica can sort
    /// ahead of the cached one.
    fn canonical_root(&self, owner: &OwnerId) -> CoreResult<Option<Node>> {
        let first = self
            .store
            .query(&Predicate::root_of(owner))?
            .into_iter()
            .next();
        let mut roots = self.roots.lock();
        match &first {
            Some(root) => {
                if let Some(previous) = roots.insert(owner.clone(), root.id) {
                    if previous != root.id {
                        debug!(owner = %owner, from = %previous, to = %root.id, "root superseded");
                    }
                }
            }
            None => {
                roots.remove(owner);
            }
        }
        Ok(first)
    }

    /// Returns the owner's root, creating it if it does not exist.
    ///
    /// Concurrent callers for the same owner observe the same root.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAuthenticated`] for an empty owner, or any
    /// store error.
    pub fn get_or_create_root(&self, owner: &OwnerId) -> CoreResult<Node> {
        require_owner(owner)?;
        if let Some(root) = self.canonical_root(owner)? {
            return Ok(root);
        }

        let predicate = Predicate::root_of(owner);

        let lock = self.owner_lock(owner);
        let _guard = lock.lock();
        let root = self.store.transaction(|txn| {
            if let Some(existing) = txn.query(&predicate).into_iter().next() {
                return Ok(existing);
            }
            let root = Node::new_root(owner.clone());
            txn.put(root.clone())?;
            debug!(owner = %owner, root = %root.id, "created root");
            Ok(root)
        })?;
        self.roots.lock().insert(owner.clone(), root.id);
        Ok(root)
    }

    /// Creates a child with `text` and appends it to `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ParentNotFound`] unless `parent` exists and
    /// belongs to `owner`.
    pub fn append_child(
        &self,
        parent: NodeId,
        text: impl Into<String>,
        owner: &OwnerId,
    ) -> CoreResult<Node> {
        require_owner(owner)?;
        let text = text.into();
        self.store.transaction(|txn| {
            let mut parent_node = txn
                .get(parent)
                .filter(|p| p.owner_id == *owner)
                .ok_or(CoreError::ParentNotFound(parent))?;
            let child = Node::new_child(owner.clone(), text);
            txn.put(child.clone())?;
            parent_node.children.push(child.id);
            txn.put(parent_node)?;
            Ok(child)
        })
    }

    /// Appends a child to the owner's root, creating the root if needed.
    ///
    /// # Errors
    ///
    /// See [`NodeGraph::get_or_create_root`] and [`NodeGraph::append_child`].
    pub fn add_to_root(&self, text: impl Into<String>, owner: &OwnerId) -> CoreResult<Node> {
        let root = self.get_or_create_root(owner)?;
        match self.append_child(root.id, text, owner) {
            Err(CoreError::ParentNotFound(_)) => {
                // The cached root vanished between the two calls.
                self.roots.lock().remove(owner);
                Err(CoreError::ParentNotFound(root.id))
            }
            other => other,
        }
    }

    /// Replaces the text of a node.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeNotFound`] unless the node exists and
    /// belongs to `owner`.
    pub fn set_text(&self, id: NodeId, text: impl Into<String>, owner: &OwnerId) -> CoreResult<Node> {
        require_owner(owner)?;
        let text = text.into();
        self.store.transaction(|txn| {
            let mut node = txn
                .get(id)
                .filter(|n| n.owner_id == *owner)
                .ok_or(CoreError::NodeNotFound(id))?;
            node.text = text;
            txn.put(node.clone())?;
            Ok(node)
        })
    }

    /// Deletes every node of `owner`. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAuthenticated`] for an empty owner, or any
    /// store error.
    pub fn delete_all(&self, owner: &OwnerId) -> CoreResult<usize> {
        require_owner(owner)?;
        let deleted = self.store.transaction(|txn| {
            let nodes = txn.query(&Predicate::owned_by(owner));
            for node in &nodes {
                txn.delete(node.id);
            }
            Ok(nodes.len())
        })?;
        self.roots.lock().remove(owner);
        debug!(owner = %owner, deleted, "deleted all nodes");
        Ok(deleted)
    }

    /// Deletes a node and its whole subtree, and removes it from its
    /// parent's children. Returns how many nodes were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeNotFound`] unless the node exists and
    /// belongs to `owner`.
    pub fn delete_node(&self, id: NodeId, owner: &OwnerId) -> CoreResult<usize> {
        require_owner(owner)?;
        let (deleted, was_root) = self.store.transaction(|txn| {
            let node = txn
                .get(id)
                .filter(|n| n.owner_id == *owner)
                .ok_or(CoreError::NodeNotFound(id))?;

            let mut subtree = Vec::new();
            let mut seen = HashSet::new();
            let mut stack = vec![node.id];
            while let Some(next) = stack.pop() {
                if !seen.insert(next) {
                    continue;
                }
                if let Some(current) = txn.get(next) {
                    stack.extend(current.children.iter().rev().copied());
                    subtree.push(next);
                }
            }

            let parents: Vec<Node> = txn
                .query(&Predicate::owned_by(owner))
                .into_iter()
                .filter(|n| n.children.contains(&id))
                .collect();
            for mut parent in parents {
                parent.children.retain(|c| *c != id);
                txn.put(parent)?;
            }
            for victim in &subtree {
                txn.delete(*victim);
            }
            Ok((subtree.len(), node.is_root))
        })?;
        if was_root {
            self.roots.lock().remove(owner);
        }
        Ok(deleted)
    }

    /// Existing children of a node, in list order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NodeNotFound`] if the node does not exist.
    pub fn children(&self, id: NodeId) -> CoreResult<Vec<Node>> {
        let node = self.store.get(id)?.ok_or(CoreError::NodeNotFound(id))?;
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            if let Some(child) = self.store.get(*child)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// All nodes of `owner`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAuthenticated`] for an empty owner.
    pub fn nodes(&self, owner: &OwnerId) -> CoreResult<Vec<Node>> {
        require_owner(owner)?;
        self.store.query(&Predicate::owned_by(owner))
    }

    /// The owner's tree, or `None` if the root does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAuthenticated`] for an empty owner.
    pub fn tree(&self, owner: &OwnerId) -> CoreResult<Option<TreeView>> {
        require_owner(owner)?;
        let Some(root) = self.store.query(&Predicate::root_of(owner))?.into_iter().next() else {
            return Ok(None);
        };

        let mut entries = Vec::new();
        let mut seen = HashSet::from([root.id]);
        let mut stack: Vec<(usize, NodeId)> =
            root.children.iter().rev().map(|c| (1, *c)).collect();
        while let Some((depth, id)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.store.get(id)? else { continue };
            stack.extend(node.children.iter().rev().map(|c| (depth + 1, *c)));
            entries.push(TreeEntry { depth, node });
        }
        Ok(Some(TreeView { root, entries }))
    }

    /// Node count and root summary for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAuthenticated`] for an empty owner.
    pub fn info(&self, owner: &OwnerId) -> CoreResult<OwnerInfo> {
        let nodes = self.nodes(owner)?;
        let root = nodes.iter().find(|n| n.is_root);
        Ok(OwnerInfo {
            owner: owner.clone(),
            root_id: root.map(|r| r.id),
            total_nodes: nodes.len(),
            root_children: root.map_or(0, |r| r.children.len()),
        })
    }
}
