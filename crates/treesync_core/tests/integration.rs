//! Integration tests for the local store and the tree layer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use treesync_core::{
    ChangeOp, CollectionChange, CoreError, LocalStore, LogicalTimestamp, Node, NodeGraph, OwnerId,
    Predicate, StoreConfig,
};

fn graph() -> NodeGraph {
    NodeGraph::new(Arc::new(LocalStore::open_in_memory().unwrap()))
}

#[test]
fn concurrent_root_creation_yields_one_root() {
    let graph = Arc::new(graph());
    let owner = OwnerId::from("alice");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let graph = Arc::clone(&graph);
            let owner = owner.clone();
            thread::spawn(move || graph.get_or_create_root(&owner).unwrap().id)
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    let roots = graph
        .store()
        .query(&Predicate::root_of(&owner))
        .unwrap();
    assert_eq!(roots.len(), 1);
}

#[test]
fn sequential_appends_keep_order() {
    let graph = graph();
    let owner = OwnerId::from("alice");
    let texts = ["first", "second", "third", "fourth"];
    for text in texts {
        graph.add_to_root(text, &owner).unwrap();
    }

    let root = graph.get_or_create_root(&owner).unwrap();
    let children: Vec<String> = graph
        .children(root.id)
        .unwrap()
        .into_iter()
        .map(|n| n.text)
        .collect();
    assert_eq!(children, texts);
}

#[test]
fn alice_scenario() {
    let graph = graph();
    let alice = OwnerId::from("alice");
    let root = graph.get_or_create_root(&alice).unwrap();
    let child = graph.append_child(root.id, "hello", &alice).unwrap();

    let info = graph.info(&alice).unwrap();
    assert_eq!(info.total_nodes, 2);
    assert_eq!(info.root_children, 1);
    assert_eq!(info.root_id, Some(root.id));

    let stored_root = graph.store().get(root.id).unwrap().unwrap();
    assert_eq!(stored_root.children, vec![child.id]);

    assert_eq!(graph.delete_all(&alice).unwrap(), 2);
    assert_eq!(graph.info(&alice).unwrap().total_nodes, 0);
}

#[test]
fn deleting_the_root_removes_every_descendant() {
    let graph = graph();
    let owner = OwnerId::from("alice");
    let a = graph.add_to_root("a", &owner).unwrap();
    let a1 = graph.append_child(a.id, "a1", &owner).unwrap();
    graph.append_child(a1.id, "a1x", &owner).unwrap();
    graph.add_to_root("b", &owner).unwrap();
    graph.add_to_root("keep", &OwnerId::from("bob")).unwrap();

    let before = graph.info(&owner).unwrap();
    assert_eq!(before.total_nodes, 5);
    let root = before.root_id.unwrap();

    assert_eq!(graph.delete_node(root, &owner).unwrap(), before.total_nodes);
    assert!(graph.nodes(&owner).unwrap().is_empty());
    assert!(graph.tree(&owner).unwrap().is_none());
    assert_eq!(graph.nodes(&OwnerId::from("bob")).unwrap().len(), 2);
}

#[test]
fn owners_do_not_see_each_other() {
    let graph = graph();
    let alice = OwnerId::from("alice");
    let bob = OwnerId::from("bob");
    let alice_root = graph.get_or_create_root(&alice).unwrap();
    graph.add_to_root("bob's", &bob).unwrap();

    assert!(matches!(
        graph.append_child(alice_root.id, "intruder", &bob),
        Err(CoreError::ParentNotFound(_))
    ));
    assert_eq!(graph.nodes(&alice).unwrap().len(), 1);
    assert_eq!(graph.nodes(&bob).unwrap().len(), 2);
    assert_eq!(graph.delete_all(&bob).unwrap(), 2);
    assert_eq!(graph.nodes(&alice).unwrap().len(), 1);
}

#[test]
fn persistent_store_recovers_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store");
    let owner = OwnerId::from("alice");
    let child_id;
    {
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let graph = NodeGraph::new(Arc::clone(&store));
        child_id = graph.add_to_root("persisted", &owner).unwrap().id;
        store.close().unwrap();
    }
    {
        // No close: recovery replays the log instead of the snapshot.
        let store = Arc::new(
            LocalStore::open_with_config(&path, StoreConfig::default().checkpoint_on_close(false))
                .unwrap(),
        );
        let graph = NodeGraph::new(Arc::clone(&store));
        graph.add_to_root("after checkpoint", &owner).unwrap();
    }

    let store = Arc::new(LocalStore::open(&path).unwrap());
    let graph = NodeGraph::new(Arc::clone(&store));
    let tree = graph.tree(&owner).unwrap().unwrap();
    let texts: Vec<&str> = tree.entries.iter().map(|e| e.node.text.as_str()).collect();
    assert_eq!(texts, vec!["persisted", "after checkpoint"]);
    assert_eq!(tree.entries[0].node.id, child_id);
    assert_eq!(store.pending_len(), 5);
}

#[test]
fn second_process_is_locked_out() {
    let dir = tempdir().unwrap();
    let _store = LocalStore::open(dir.path()).unwrap();
    assert!(matches!(LocalStore::open(dir.path()), Err(CoreError::Locked)));
}

#[test]
fn collection_observer_tracks_owner_nodes() {
    let graph = graph();
    let owner = OwnerId::from("alice");
    let seen: Arc<Mutex<Vec<CollectionChange>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    graph
        .store()
        .observe_collection(Predicate::owned_by(&owner), move |c| sink.lock().push(c.clone()))
        .unwrap();

    graph.get_or_create_root(&owner).unwrap();
    graph.add_to_root("a", &owner).unwrap();
    graph.add_to_root("other owner", &"bob".into()).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].count, 1);
    assert_eq!(seen[0].insertions, vec![0]);
    assert_eq!(seen[1].count, 2);
    assert_eq!(seen[1].insertions, vec![1]);
    assert_eq!(seen[1].modifications, vec![0]);
}

#[test]
fn unobserve_from_callback_is_deferred() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let calls = Arc::new(Mutex::new(0usize));
    let token = Arc::new(Mutex::new(None));

    {
        let weak = Arc::downgrade(&store);
        let calls = Arc::clone(&calls);
        let token_slot = Arc::clone(&token);
        let registered = store
            .observe_collection(Predicate::All, move |_| {
                *calls.lock() += 1;
                if let (Some(store), Some(token)) = (weak.upgrade(), token_slot.lock().take()) {
                    assert!(store.unobserve(token));
                }
            })
            .unwrap();
        *token.lock() = Some(registered);
    }

    store.put(Node::new_child("alice".into(), "one")).unwrap();
    store.put(Node::new_child("alice".into(), "two")).unwrap();
    assert_eq!(*calls.lock(), 1);
}

#[test]
fn callbacks_cannot_write() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let result = Arc::new(Mutex::new(None));
    {
        let weak = Arc::downgrade(&store);
        let result = Arc::clone(&result);
        store
            .observe_collection(Predicate::All, move |_| {
                if let Some(store) = weak.upgrade() {
                    let outcome = store.put(Node::new_child("alice".into(), "nested"));
                    *result.lock() = Some(matches!(outcome, Err(CoreError::ReentrantWrite)));
                }
            })
            .unwrap();
    }
    store.put(Node::new_child("alice".into(), "outer")).unwrap();
    assert_eq!(*result.lock(), Some(true));
}

#[test]
fn echo_of_own_change_is_a_noop() {
    let graph = graph();
    let owner = OwnerId::from("alice");
    let child = graph.add_to_root("mine", &owner).unwrap();
    let store = graph.store();
    let echo = store.record(child.id).unwrap().unwrap();

    let changes = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&changes);
    store
        .observe_object(child.id, move |_| *sink.lock() += 1)
        .unwrap();

    let report = store.apply_remote(vec![ChangeOp::Upsert(echo)]).unwrap();
    assert!(report.is_empty());
    assert_eq!(*changes.lock(), 0);
}

#[test]
fn remote_delete_of_edited_node_is_an_existence_conflict() {
    let graph = graph();
    let owner = OwnerId::from("alice");
    let child = graph.add_to_root("edited", &owner).unwrap();
    let store = graph.store();

    let conflicts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&conflicts);
    store
        .observe_conflicts(move |c| sink.lock().push(c.clone()))
        .unwrap();

    store
        .apply_remote(vec![ChangeOp::Delete {
            id: child.id,
            owner_id: owner.clone(),
            at: LogicalTimestamp::new(store.clock() + 5, 1),
        }])
        .unwrap();

    assert_eq!(conflicts.lock().len(), 1);
    assert!(store.get(child.id).unwrap().is_none());
    let root = graph.get_or_create_root(&owner).unwrap();
    assert!(root.children.is_empty());
}

#[test]
fn nothing_fires_after_close() {
    let store = LocalStore::open_in_memory().unwrap();
    let calls = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&calls);
    store
        .observe_collection(Predicate::All, move |_| *sink.lock() += 1)
        .unwrap();
    store.close().unwrap();

    assert!(store.put(Node::new_root("alice".into())).is_err());
    assert!(store
        .apply_remote(vec![ChangeOp::Delete {
            id: treesync_core::NodeId::new(),
            owner_id: "alice".into(),
            at: LogicalTimestamp::ZERO,
        }])
        .is_err());
    assert_eq!(*calls.lock(), 0);
}
