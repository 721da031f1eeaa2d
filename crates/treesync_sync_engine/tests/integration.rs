//! End-to-end tests: connections against an in-process authority.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treesync_core::{LocalStore, Node, OwnerId, Predicate};
use treesync_sync_engine::{
    AnonymousAuth, Connection, ConnectionState, FailureKind, FramedTransport, LoopbackClient,
    RetryConfig, StaticAuth, SyncConfig, SyncError, SyncTransport,
};
use treesync_sync_protocol::ErrorCode;
use treesync_sync_server::{RemoteAuthority, ServerConfig};

const APP: &str = "integration-app";

struct Device {
    conn: Connection,
    link: LoopbackClient<RemoteAuthority>,
}

fn authority_with(config: ServerConfig) -> Arc<RemoteAuthority> {
    Arc::new(RemoteAuthority::new(config).unwrap())
}

fn authority() -> Arc<RemoteAuthority> {
    authority_with(ServerConfig::new(APP))
}

fn config() -> SyncConfig {
    SyncConfig::new(APP)
        .with_poll_interval(Duration::from_millis(50))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50)),
        )
        .with_shutdown_grace(Duration::from_millis(500))
}

fn transport(link: &LoopbackClient<RemoteAuthority>) -> Arc<dyn SyncTransport> {
    Arc::new(FramedTransport::new(link.clone()))
}

async fn connect_with(
    authority: &Arc<RemoteAuthority>,
    principal: &str,
    config: SyncConfig,
) -> Device {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let link = LoopbackClient::new(authority.clone());
    let auth = StaticAuth::new(principal, authority.issue_token(principal).unwrap());
    let conn = Connection::open(store, transport(&link), &auth, config)
        .await
        .unwrap();
    Device { conn, link }
}

async fn connect(authority: &Arc<RemoteAuthority>, principal: &str) -> Device {
    connect_with(authority, principal, config()).await
}

fn root_texts(device: &Device) -> Vec<String> {
    let root = device.conn.get_or_create_root().unwrap();
    device
        .conn
        .children(root.id)
        .unwrap()
        .into_iter()
        .map(|n| n.text)
        .collect()
}

#[tokio::test]
async fn writes_reach_the_authority() {
    let authority = authority();
    let alice = connect(&authority, "alice").await;
    assert_eq!(alice.conn.state(), ConnectionState::Steady);

    alice.conn.get_or_create_root().unwrap();
    alice.conn.add_to_root("one").unwrap();
    alice.conn.add_to_root("two").unwrap();
    alice.conn.sync_now().await.unwrap();

    let info = alice.conn.info().unwrap();
    assert_eq!(info.total_nodes, 3);
    assert_eq!(info.root_children, 2);

    let remote = authority
        .store()
        .records(&Predicate::owned_by(&OwnerId::from("alice")))
        .unwrap();
    assert_eq!(remote.len(), 3);
    assert_eq!(alice.conn.store().pending_len(), 0);

    alice.conn.close().await.unwrap();
}

#[tokio::test]
async fn two_devices_converge() {
    let authority = authority();
    let first = connect(&authority, "alice").await;
    let second = connect(&authority, "alice").await;

    let root = first.conn.get_or_create_root().unwrap();
    first.conn.add_to_root("a").unwrap();
    first.conn.add_to_root("b").unwrap();
    first.conn.sync_now().await.unwrap();
    second.conn.sync_now().await.unwrap();

    assert_eq!(second.conn.get_or_create_root().unwrap().id, root.id);
    assert_eq!(root_texts(&second), vec!["a", "b"]);
    assert_eq!(second.conn.info().unwrap().total_nodes, 3);

    first.conn.close().await.unwrap();
    second.conn.close().await.unwrap();
}

#[tokio::test]
async fn other_principals_stay_invisible() {
    let authority = authority();
    let alice = connect(&authority, "alice").await;
    let bob = connect(&authority, "bob").await;

    alice.conn.add_to_root("secret").unwrap();
    alice.conn.sync_now().await.unwrap();
    bob.conn.sync_now().await.unwrap();

    assert!(bob.conn.store().is_empty());
    assert_eq!(bob.conn.info().unwrap().total_nodes, 0);
}

#[tokio::test]
async fn offline_conflict_is_reported_once_and_converges() {
    let authority = authority();
    let a = connect(&authority, "alice").await;
    let b = connect(&authority, "alice").await;

    let draft = a.conn.add_to_root("draft").unwrap();
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();

    let conflicts = Arc::new(AtomicUsize::new(0));
    let seen = conflicts.clone();
    b.conn
        .observe_conflicts(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    b.link.set_online(false);
    b.conn.set_text(draft.id, "from b").unwrap();
    a.conn.set_text(draft.id, "from a").unwrap();
    a.conn.sync_now().await.unwrap();

    b.link.set_online(true);
    for _ in 0..3 {
        if b.conn.sync_now().await.is_ok() {
            break;
        }
    }
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();

    let on_a = a.conn.store().get(draft.id).unwrap().unwrap().text;
    let on_b = b.conn.store().get(draft.id).unwrap().unwrap().text;
    assert_eq!(on_a, on_b);
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_token_fails_open() {
    let authority = authority();
    let link = LoopbackClient::new(authority.clone());
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let auth = StaticAuth::new("alice", b"forged".to_vec());

    let err = Connection::open(store.clone(), transport(&link), &auth, config())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::AuthFailed);
    assert!(!store.is_closed());
}

#[tokio::test]
async fn expired_token_ends_in_error_state() {
    let authority =
        authority_with(ServerConfig::new(APP).with_token_expiry(Duration::from_millis(500)));
    let alice = connect(&authority, "alice").await;
    let mut errors = alice.conn.errors();

    tokio::time::sleep(Duration::from_millis(700)).await;
    authority.drop_sessions();
    for _ in 0..3 {
        if alice.conn.state() == ConnectionState::Error {
            break;
        }
        let _ = alice.conn.sync_now().await;
    }
    assert_eq!(alice.conn.state(), ConnectionState::Error);

    let failure = loop {
        let failure = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        if failure.kind == FailureKind::AuthFailed {
            break failure;
        }
    };
    assert!(failure.message.contains("unauthenticated"));
    assert!(matches!(alice.conn.sync_now().await, Err(SyncError::Closed)));

    // Local writes keep working after the connection gave up.
    alice.conn.add_to_root("still local").unwrap();
}

#[tokio::test]
async fn foreign_writes_are_rejected() {
    let authority = authority();
    let alice = connect(&authority, "alice").await;
    let mut state = alice.conn.state_watch();

    alice
        .conn
        .store()
        .put(Node::new_child(OwnerId::from("mallory"), "forged"))
        .unwrap();
    let _ = alice.conn.sync_now().await;

    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Error),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(authority
        .store()
        .records(&Predicate::owned_by(&OwnerId::from("mallory")))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reconnects_after_outage() {
    let authority = authority();
    let a = connect(&authority, "alice").await;
    let b = connect(&authority, "alice").await;
    a.conn.get_or_create_root().unwrap();
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();

    b.link.set_online(false);
    assert!(b.conn.sync_now().await.is_err());
    a.conn.add_to_root("while away").unwrap();
    a.conn.sync_now().await.unwrap();
    b.conn.add_to_root("offline note").unwrap();
    assert!(b.conn.store().pending_len() > 0);

    b.link.set_online(true);
    let mut synced = false;
    for _ in 0..5 {
        if b.conn.sync_now().await.is_ok() {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced);
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();

    assert_eq!(root_texts(&a).len(), 2);
    assert_eq!(root_texts(&a), root_texts(&b));
    assert!(b.conn.stats().sessions >= 2);
    assert_eq!(b.conn.state(), ConnectionState::Steady);
}

#[tokio::test]
async fn subscriptions_are_idempotent() {
    let authority = authority();
    let alice = connect(&authority, "alice").await;
    let subs = alice.conn.subscriptions();
    let before = subs.version();

    let roots = Predicate::root_of(&OwnerId::from("alice"));
    let first = subs.add(roots.clone());
    let second = subs.add(roots);
    assert_eq!(first, second);
    assert_eq!(subs.version(), before + 1);
    assert_eq!(subs.len(), 2);
    assert!(!subs.remove(subs.bootstrap()));

    alice.conn.sync_now().await.unwrap();
    assert!(subs.remove(first));
    alice.conn.sync_now().await.unwrap();
    assert_eq!(subs.len(), 1);
}

#[tokio::test]
async fn observers_are_silent_after_close() {
    let authority = authority();
    let a = connect(&authority, "alice").await;
    let other = connect(&authority, "alice").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    a.conn
        .observe_collection(Predicate::owned_by(&OwnerId::from("alice")), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    a.conn.add_to_root("first").unwrap();
    a.conn.close().await.unwrap();
    let after_close = calls.load(Ordering::SeqCst);
    assert!(after_close > 0);

    other.conn.sync_now().await.unwrap();
    other.conn.add_to_root("second").unwrap();
    other.conn.sync_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(calls.load(Ordering::SeqCst), after_close);
    assert_eq!(a.conn.state(), ConnectionState::Closed);
    assert!(a.conn.add_to_root("late").is_err());
    a.conn.close().await.unwrap();

    // The close flushed the first write.
    assert_eq!(root_texts(&other), vec!["first", "second"]);
}

#[tokio::test]
async fn expired_cursor_resubscribes() {
    let authority = authority_with(ServerConfig::new(APP).with_max_log_entries(4));
    let a = connect(&authority, "alice").await;
    let b = connect_with(
        &authority,
        "alice",
        config().with_poll_interval(Duration::from_secs(3600)),
    )
    .await;

    for i in 0..6 {
        a.conn.add_to_root(format!("item {i}")).unwrap();
        a.conn.sync_now().await.unwrap();
    }

    let first = b.conn.sync_now().await;
    assert!(matches!(
        first,
        Err(SyncError::Rejected {
            code: ErrorCode::CursorExpired,
            ..
        })
    ));
    let mut synced = false;
    for _ in 0..3 {
        if b.conn.sync_now().await.is_ok() {
            synced = true;
            break;
        }
    }
    assert!(synced);
    assert_eq!(root_texts(&b).len(), 6);
    assert_eq!(root_texts(&a), root_texts(&b));
}

#[tokio::test]
async fn remote_delete_prunes_the_parent() {
    let authority = authority();
    let a = connect(&authority, "alice").await;
    let b = connect(&authority, "alice").await;

    let root = a.conn.get_or_create_root().unwrap();
    let branch = a.conn.add_to_root("branch").unwrap();
    let leaf = a.conn.append_child(branch.id, "leaf").unwrap();
    a.conn.add_to_root("keep").unwrap();
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();
    assert_eq!(b.conn.info().unwrap().total_nodes, 4);

    assert_eq!(a.conn.delete_node(branch.id).unwrap(), 2);
    a.conn.sync_now().await.unwrap();
    b.conn.sync_now().await.unwrap();

    assert!(b.conn.store().get(branch.id).unwrap().is_none());
    assert!(b.conn.store().get(leaf.id).unwrap().is_none());
    let children: Vec<_> = b
        .conn
        .children(root.id)
        .unwrap()
        .into_iter()
        .map(|n| n.text)
        .collect();
    assert_eq!(children, vec!["keep"]);
}

#[tokio::test]
async fn anonymous_identity_syncs() {
    let authority = authority();
    let link = LoopbackClient::new(authority.clone());
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let auth = AnonymousAuth::new();

    let conn = Connection::open(store, transport(&link), &auth, config())
        .await
        .unwrap();
    let identity = auth.identity().unwrap();
    assert_eq!(conn.principal(), &identity.principal);
    assert!(!conn.principal().is_empty());

    conn.add_to_root("hello").unwrap();
    conn.sync_now().await.unwrap();
    let remote = authority
        .store()
        .records(&Predicate::owned_by(conn.principal()))
        .unwrap();
    assert_eq!(remote.len(), 2);
    conn.close().await.unwrap();
}
