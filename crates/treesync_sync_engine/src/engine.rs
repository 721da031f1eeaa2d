//! Sync state machine.
//!
//! One [`SyncEngine`] backs each connection. Cycles are serialized by the
//! session lock, so the background task and `sync_now` callers never
//! interleave.

use crate::auth::Identity;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::state::{ConnectionState, SyncCycleResult, SyncStats};
use crate::subscriptions::SubscriptionManager;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};
use treesync_core::{ChangeOp, LocalStore, NodeId, NodeRecord, PendingChange, Predicate};
use treesync_sync_protocol::{
    Cursor, OutboundChange, ProtocolError, SessionId, SyncRequest, SyncResponse,
};

/// An open session with the authority.
#[derive(Debug)]
pub(crate) struct Session {
    id: SessionId,
    /// Last change-log cursor applied locally.
    cursor: Cursor,
    /// Subscription version installed on the authority.
    subscribed: Option<u64>,
}

pub(crate) struct SyncEngine {
    config: SyncConfig,
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    identity: Identity,
    subscriptions: Arc<SubscriptionManager>,
    state: watch::Sender<ConnectionState>,
    errors: broadcast::Sender<SyncFailure>,
    wake: Notify,
    session: AsyncMutex<Option<Session>>,
    /// Consecutive retryable failures.
    failures: AtomicU32,
    stats: Mutex<SyncStats>,
}

fn unexpected(expected: &'static str, actual: &SyncResponse) -> SyncError {
    ProtocolError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
    .into()
}

impl SyncEngine {
    pub(crate) fn new(
        config: SyncConfig,
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        identity: Identity,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (errors, _) = broadcast::channel(config.error_capacity.max(1));
        Self {
            config,
            store,
            transport,
            identity,
            subscriptions,
            state,
            errors,
            wake: Notify::new(),
            session: AsyncMutex::new(None),
            failures: AtomicU32::new(0),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub(crate) fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn errors(&self) -> broadcast::Receiver<SyncFailure> {
        self.errors.subscribe()
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Requests a cycle from the background task.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Moves to `next` unless the engine already stopped.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || current.is_final() {
                return false;
            }
            debug!(from = %current, to = %next, "connection state changed");
            *current = next;
            true
        });
    }

    fn report(&self, err: &SyncError) {
        let failure = SyncFailure::from(err);
        self.stats.lock().last_error = Some(failure.message.clone());
        // Nobody listening is fine.
        let _ = self.errors.send(failure);
    }

    /// Runs one full cycle, opening a session first if needed.
    pub(crate) async fn sync_once(&self) -> SyncResult<SyncCycleResult> {
        let mut session = self.session.lock().await;
        if self.state().is_final() {
            return Err(SyncError::Closed);
        }
        let started = Instant::now();
        match self.cycle(&mut session).await {
            Ok(mut result) => {
                result.duration = started.elapsed();
                self.failures.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Steady);
                let mut stats = self.stats.lock();
                stats.cycles_completed += 1;
                stats.changes_pulled += result.pulled;
                stats.changes_pushed += result.pushed;
                stats.conflicts_resolved += result.conflicts;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                Ok(result)
            }
            Err(err) => {
                self.fail(&mut session, &err);
                Err(err)
            }
        }
    }

    fn fail(&self, session: &mut Option<Session>, err: &SyncError) {
        if err.is_terminal() {
            error!(error = %err, principal = %self.identity.principal, "sync stopped");
            *session = None;
            self.set_state(ConnectionState::Error);
            self.report(err);
        } else if err.is_retryable() {
            *session = None;
            self.set_state(ConnectionState::Connecting);
            self.stats.lock().retries += 1;
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            let retry = &self.config.retry;
            if retry.exhausted(failures) && !retry.exhausted(failures - 1) {
                warn!(error = %err, failures, "retry budget exhausted, still reconnecting");
                self.report(err);
            } else {
                debug!(error = %err, failures, "sync failed, reconnecting");
            }
        } else {
            warn!(error = %err, "sync cycle failed");
            self.report(err);
        }
    }

    async fn cycle(&self, slot: &mut Option<Session>) -> SyncResult<SyncCycleResult> {
        let mut result = SyncCycleResult::default();
        if slot.is_none() {
            self.set_state(ConnectionState::Connecting);
            *slot = Some(self.hello().await?);
            result.reconnected = true;
        }
        let Some(session) = slot.as_mut() else {
            return Err(SyncError::NotConnected);
        };

        let (predicates, version) = self.subscriptions.confined();
        if session.subscribed != Some(version) {
            self.set_state(ConnectionState::Subscribing);
            result.conflicts += self.subscribe(session, predicates, version).await?;
        }

        self.set_state(ConnectionState::Syncing);
        let (pulled, conflicts) = self.pull(session).await?;
        result.pulled = pulled;
        result.conflicts += conflicts;
        result.pushed = self.push(session).await?;
        self.ack(session).await?;
        Ok(result)
    }

    async fn hello(&self) -> SyncResult<Session> {
        let response = self
            .transport
            .request(SyncRequest::Hello {
                app_id: self.config.app_id.clone(),
                principal: self.identity.principal.as_str().to_string(),
                token: self.identity.token.clone(),
                protocol_version: self.config.protocol_version,
            })
            .await?;
        match response {
            SyncResponse::Welcome { session, cursor } => {
                info!(session = %session, principal = %self.identity.principal, "session opened");
                self.stats.lock().sessions += 1;
                Ok(Session {
                    id: session,
                    cursor,
                    subscribed: None,
                })
            }
            other => Err(unexpected("welcome", &other)),
        }
    }

    /// Installs the subscriptions and reconciles against the snapshot.
    /// Returns the number of conflicts resolved.
    async fn subscribe(
        &self,
        session: &mut Session,
        predicates: Vec<Predicate>,
        version: u64,
    ) -> SyncResult<u64> {
        let response = self
            .transport
            .request(SyncRequest::Subscribe {
                session: session.id,
                predicates: predicates.clone(),
            })
            .await?;
        let (snapshot, cursor) = match response {
            SyncResponse::Subscribed {
                snapshot, cursor, ..
            } => (snapshot, cursor),
            other => return Err(unexpected("subscribed", &other)),
        };
        let conflicts = self.reconcile(snapshot, &predicates)?;
        session.cursor = cursor;
        session.subscribed = Some(version);
        debug!(session = %session.id, cursor, version, "subscriptions installed");
        Ok(conflicts)
    }

    /// Makes the subscribed part of the local store match `snapshot`.
    ///
    /// Remote records are merged in. Local nodes matched by `predicates`
    /// but missing remotely are deleted unless they have pending changes.
    fn reconcile(&self, snapshot: Vec<NodeRecord>, predicates: &[Predicate]) -> SyncResult<u64> {
        let remote: HashSet<NodeId> = snapshot.iter().map(|r| r.id).collect();
        let mut ops: Vec<ChangeOp> = snapshot.into_iter().map(ChangeOp::Upsert).collect();

        let mut stale = HashSet::new();
        for predicate in predicates {
            for record in self.store.records(predicate)? {
                if remote.contains(&record.id)
                    || self.store.has_pending(record.id)
                    || !stale.insert(record.id)
                {
                    continue;
                }
                ops.push(ChangeOp::Delete {
                    id: record.id,
                    owner_id: record.owner_id.clone(),
                    at: record.max_timestamp(),
                });
            }
        }

        let report = self.store.apply_remote(ops)?;
        if !report.applied.is_empty() {
            info!(
                applied = report.applied.len(),
                removed = stale.len(),
                "reconciled with authority snapshot"
            );
        }
        Ok(report.conflicts.len() as u64)
    }

    /// Pulls until the authority has nothing more. Returns the number of
    /// changes pulled and conflicts resolved.
    async fn pull(&self, session: &mut Session) -> SyncResult<(u64, u64)> {
        let mut pulled = 0;
        let mut conflicts = 0;
        loop {
            let response = self
                .transport
                .request(SyncRequest::Pull {
                    session: session.id,
                    cursor: session.cursor,
                    limit: self.config.pull_batch_size,
                })
                .await?;
            let (changes, cursor, has_more) = match response {
                SyncResponse::Changes {
                    changes,
                    cursor,
                    has_more,
                } => (changes, cursor, has_more),
                other => return Err(unexpected("changes", &other)),
            };
            if !changes.is_empty() {
                pulled += changes.len() as u64;
                let ops = changes.into_iter().map(|c| c.op).collect();
                conflicts += self.store.apply_remote(ops)?.conflicts.len() as u64;
            }
            session.cursor = cursor;
            if !has_more {
                break;
            }
        }
        if pulled > 0 {
            debug!(pulled, conflicts, cursor = session.cursor, "pulled remote changes");
        }
        Ok((pulled, conflicts))
    }

    /// Pushes pending changes in sequence order, acknowledging each batch.
    async fn push(&self, session: &Session) -> SyncResult<u64> {
        let mut pushed = 0;
        loop {
            let pending = self
                .store
                .pending_changes(self.config.push_batch_size.max(1) as usize)?;
            let Some(last) = pending.last().map(|p| p.seq) else {
                break;
            };
            let changes = self.outbound(&pending)?;
            if let Some(sent) = changes.iter().map(|c| c.seq).max() {
                let count = changes.len() as u64;
                let response = self
                    .transport
                    .request(SyncRequest::Push {
                        session: session.id,
                        changes,
                    })
                    .await?;
                match response {
                    SyncResponse::PushAck { acked_up_to, .. } if acked_up_to >= sent => {}
                    SyncResponse::PushAck { acked_up_to, .. } => {
                        return Err(SyncError::Protocol(format!(
                            "authority acknowledged {acked_up_to} of {sent}"
                        )));
                    }
                    other => return Err(unexpected("push_ack", &other)),
                }
                pushed += count;
            }
            self.store.acknowledge(last)?;
        }
        if pushed > 0 {
            debug!(pushed, "pushed local changes");
        }
        Ok(pushed)
    }

    /// Builds the wire form of a pending batch: one change per node, at the
    /// position of its newest entry, carrying the node's current state.
    ///
    /// The authority prunes dangling children once per batch, so only
    /// membership in the batch matters, not the order inside it.
    fn outbound(&self, pending: &[PendingChange]) -> SyncResult<Vec<OutboundChange>> {
        let newest: HashMap<NodeId, usize> = pending
            .iter()
            .enumerate()
            .map(|(i, p)| (p.node_id, i))
            .collect();

        let mut changes = Vec::with_capacity(newest.len());
        for (i, entry) in pending.iter().enumerate() {
            if newest.get(&entry.node_id) != Some(&i) {
                continue;
            }
            let op = if entry.is_delete() {
                ChangeOp::Delete {
                    id: entry.node_id,
                    owner_id: entry.owner_id.clone(),
                    at: entry.committed_at,
                }
            } else {
                match self.store.record(entry.node_id)? {
                    Some(record) => ChangeOp::Upsert(record),
                    None => continue,
                }
            };
            changes.push(OutboundChange { seq: entry.seq, op });
        }
        Ok(changes)
    }

    async fn ack(&self, session: &Session) -> SyncResult<()> {
        let response = self
            .transport
            .request(SyncRequest::Ack {
                session: session.id,
                cursor: session.cursor,
            })
            .await?;
        match response {
            SyncResponse::Acked => Ok(()),
            other => Err(unexpected("acked", &other)),
        }
    }

    /// Pushes what is pending, if the engine can still sync.
    pub(crate) async fn flush(&self) -> SyncResult<()> {
        if self.store.pending_len() == 0 || self.state().is_final() {
            return Ok(());
        }
        self.sync_once().await.map(|_| ())
    }

    /// Waits for any running cycle, then stops the engine for good.
    pub(crate) async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        *session = None;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed {
                return false;
            }
            *current = ConnectionState::Closed;
            true
        });
    }

    /// Background loop: cycles on local commits, subscription changes and
    /// every poll interval; backs off after failures.
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            let delay = if attempt == 0 {
                self.config.poll_interval
            } else {
                self.config.retry.delay_for_attempt(attempt)
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.wake.notified(), if attempt == 0 => {}
                _ = self.subscriptions.changed().notified(), if attempt == 0 => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.sync_once().await {
                Ok(_) => attempt = 0,
                Err(err) if err.is_retryable() => {
                    attempt = attempt.saturating_add(1);
                    debug!(attempt, "backing off before reconnect");
                }
                Err(_) if self.state().is_final() => break,
                Err(_) => attempt = 0,
            }
        }
        debug!(principal = %self.identity.principal, "sync task stopped");
    }
}
