//! Principal-bound handle over a local store and its sync task.

use crate::auth::{AuthProvider, Identity};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::state::{ConnectionState, SyncCycleResult, SyncStats};
use crate::subscriptions::SubscriptionManager;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treesync_core::{
    ChangeOrigin, CollectionChange, ConflictResolved, CoreResult, LocalStore, Node, NodeGraph,
    NodeId, ObjectChange, ObserverToken, OwnerId, OwnerInfo, Predicate, TreeView, WatchId,
};

/// An open replication session for one principal.
///
/// Graph operations write to the local store immediately and never wait
/// for the network. The background task pushes them and merges remote
/// changes in.
///
/// ```rust,ignore
/// let conn = Connection::open(store, transport, &auth, SyncConfig::new("app")).await?;
/// let node = conn.add_to_root("hello")?;
/// conn.sync_now().await?;
/// conn.close().await?;
/// ```
pub struct Connection {
    engine: Arc<SyncEngine>,
    store: Arc<LocalStore>,
    graph: NodeGraph,
    principal: OwnerId,
    subscriptions: Arc<SubscriptionManager>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    watch_id: WatchId,
    closed: AtomicBool,
}

async fn authenticate(
    auth: &dyn AuthProvider,
    transport: &dyn SyncTransport,
    config: &SyncConfig,
) -> SyncResult<Identity> {
    let mut attempt = 0;
    loop {
        match auth.authenticate(transport, &config.app_id).await {
            Ok(identity) => return Ok(identity),
            Err(err) if err.is_retryable() && !config.retry.exhausted(attempt + 1) => {
                attempt += 1;
                debug!(error = %err, attempt, "authentication failed, retrying");
                tokio::time::sleep(config.retry.delay_for_attempt(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

impl Connection {
    /// Authenticates, opens a session, installs the bootstrap subscription
    /// and runs the first cycle, then starts the background task.
    ///
    /// # Errors
    ///
    /// Fails if authentication fails, or if the first cycle cannot
    /// complete within the retry budget. The store stays open either way.
    pub async fn open(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        auth: &dyn AuthProvider,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let identity = authenticate(auth, transport.as_ref(), &config).await?;
        if identity.principal.is_empty() {
            return Err(SyncError::AuthFailed("empty principal".into()));
        }
        let principal = identity.principal.clone();
        let subscriptions = Arc::new(SubscriptionManager::new(principal.clone()));
        let engine = Arc::new(SyncEngine::new(
            config,
            store.clone(),
            transport,
            identity,
            subscriptions.clone(),
        ));

        let mut attempt = 0;
        loop {
            match engine.sync_once().await {
                Ok(result) => {
                    debug!(pulled = result.pulled, pushed = result.pushed, "bootstrap complete");
                    break;
                }
                Err(err) if err.is_retryable() && !engine.config().retry.exhausted(attempt + 1) => {
                    attempt += 1;
                    tokio::time::sleep(engine.config().retry.delay_for_attempt(attempt)).await;
                }
                Err(err) => {
                    engine.shutdown().await;
                    return Err(err);
                }
            }
        }

        let weak: Weak<SyncEngine> = Arc::downgrade(&engine);
        let watch_id = store.feed().watch(move |records| {
            if records.iter().any(|r| r.origin == ChangeOrigin::Local) {
                if let Some(engine) = weak.upgrade() {
                    engine.wake();
                }
            }
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.clone().run(shutdown_rx));
        info!(principal = %principal, "connection open");

        Ok(Self {
            engine,
            graph: NodeGraph::new(store.clone()),
            store,
            principal,
            subscriptions,
            shutdown,
            task: Mutex::new(Some(task)),
            watch_id,
            closed: AtomicBool::new(false),
        })
    }

    /// Principal every write is owned by.
    pub fn principal(&self) -> &OwnerId {
        &self.principal
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The graph layer over the local store.
    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    /// Returns the principal's root, creating it if absent.
    pub fn get_or_create_root(&self) -> CoreResult<Node> {
        self.graph.get_or_create_root(&self.principal)
    }

    /// Appends a child under `parent`.
    pub fn append_child(&self, parent: NodeId, text: impl Into<String>) -> CoreResult<Node> {
        self.graph.append_child(parent, text, &self.principal)
    }

    /// Appends a child under the principal's root.
    pub fn add_to_root(&self, text: impl Into<String>) -> CoreResult<Node> {
        self.graph.add_to_root(text, &self.principal)
    }

    /// Replaces a node's text.
    pub fn set_text(&self, id: NodeId, text: impl Into<String>) -> CoreResult<Node> {
        self.graph.set_text(id, text, &self.principal)
    }

    /// Deletes every node of the principal.
    pub fn delete_all(&self) -> CoreResult<usize> {
        self.graph.delete_all(&self.principal)
    }

    /// Deletes a node and its subtree.
    pub fn delete_node(&self, id: NodeId) -> CoreResult<usize> {
        self.graph.delete_node(id, &self.principal)
    }

    /// Children of `id` in order.
    pub fn children(&self, id: NodeId) -> CoreResult<Vec<Node>> {
        self.graph.children(id)
    }

    /// Every node of the principal.
    pub fn nodes(&self) -> CoreResult<Vec<Node>> {
        self.graph.nodes(&self.principal)
    }

    /// The principal's tree, if a root exists.
    pub fn tree(&self) -> CoreResult<Option<TreeView>> {
        self.graph.tree(&self.principal)
    }

    /// Summary counts for the principal.
    pub fn info(&self) -> CoreResult<OwnerInfo> {
        self.graph.info(&self.principal)
    }

    /// See [`LocalStore::observe_collection`].
    pub fn observe_collection<F>(&self, predicate: Predicate, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&CollectionChange) + Send + 'static,
    {
        self.store.observe_collection(predicate, callback)
    }

    /// See [`LocalStore::observe_object`].
    pub fn observe_object<F>(&self, id: NodeId, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&ObjectChange) + Send + 'static,
    {
        self.store.observe_object(id, callback)
    }

    /// See [`LocalStore::observe_conflicts`].
    pub fn observe_conflicts<F>(&self, callback: F) -> CoreResult<ObserverToken>
    where
        F: FnMut(&ConflictResolved) + Send + 'static,
    {
        self.store.observe_conflicts(callback)
    }

    /// Removes an observer.
    pub fn unobserve(&self, token: ObserverToken) -> bool {
        self.store.unobserve(token)
    }

    /// Predicates replicated by this connection.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Receiver for state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.engine.state_watch()
    }

    /// Receiver for sync failures reported from now on.
    pub fn errors(&self) -> broadcast::Receiver<SyncFailure> {
        self.engine.errors()
    }

    /// Counters since open.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Runs one cycle now and waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] after close or a terminal failure,
    /// otherwise the error of the cycle.
    pub async fn sync_now(&self) -> SyncResult<SyncCycleResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        self.engine.sync_once().await
    }

    /// Seals the store, pushes what is pending within the shutdown grace,
    /// stops the task and closes the store. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the store's close error. Flush failures are logged.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.seal();
        let grace = self.engine.config().shutdown_grace;

        match tokio::time::timeout(grace, self.engine.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "final flush failed"),
            Err(_) => warn!(pending = self.store.pending_len(), "final flush timed out"),
        }

        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("sync task did not stop in time, aborting");
                task.abort();
            }
        }
        self.engine.shutdown().await;
        self.store.feed().unwatch(self.watch_id);
        self.store.close()?;
        info!(principal = %self.principal, "connection closed");
        Ok(())
    }

    /// Whether [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.store.feed().unwatch(self.watch_id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("principal", &self.principal)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
