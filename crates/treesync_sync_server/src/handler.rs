//! Request handlers.

use crate::error::{ServerError, ServerResult};
use crate::server::{RemoteAuthority, Session};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use treesync_core::{ChangeOp, NodeRecord, OwnerId, Predicate};
use treesync_sync_protocol::{
    decode_request, encode_response, Cursor, ErrorCode, FrameHandler, OutboundChange, SessionId,
    SyncResponse, PROTOCOL_VERSION,
};

impl RemoteAuthority {
    pub(crate) fn handle_anonymous_login(&self, app_id: &str) -> ServerResult<SyncResponse> {
        self.check_app(app_id)?;
        let (principal, token) = self.anonymous_login()?;
        Ok(SyncResponse::Credentials { principal, token })
    }

    pub(crate) fn handle_hello(
        &self,
        app_id: &str,
        principal: &str,
        token: &[u8],
        protocol_version: u16,
    ) -> ServerResult<SyncResponse> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::InvalidRequest(format!(
                "unsupported protocol version: {protocol_version}"
            )));
        }
        self.check_app(app_id)?;
        if principal.trim().is_empty() {
            return Err(ServerError::AuthenticationFailed("empty principal".into()));
        }
        if let Err(err) = self
            .validator
            .validate_token(token, &self.config.app_id, principal)
        {
            warn!(principal, error = %err, "rejected credentials");
            return Err(err);
        }

        let cursor = self.cursor();
        let session = self.open_session(OwnerId::new(principal), cursor);
        info!(principal, session = %session, "session opened");
        Ok(SyncResponse::Welcome { session, cursor })
    }

    pub(crate) fn handle_subscribe(
        &self,
        id: SessionId,
        predicates: Vec<Predicate>,
    ) -> ServerResult<SyncResponse> {
        let session = self.session(id)?;
        let confined: Vec<Predicate> = predicates
            .into_iter()
            .map(|p| confine(p, &session.principal))
            .collect();

        let log = self.log.lock();
        let mut seen = HashSet::new();
        let mut snapshot: Vec<NodeRecord> = Vec::new();
        for predicate in &confined {
            for record in self.store.records(predicate)? {
                if seen.insert(record.id) {
                    snapshot.push(record);
                }
            }
        }
        snapshot.sort_by(|a, b| (a.created, a.id).cmp(&(b.created, b.id)));
        let cursor = log.changes.head();
        drop(log);

        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownSession(id))?;
        entry.predicates = confined;
        entry.cursor = cursor;
        drop(sessions);

        debug!(session = %id, nodes = snapshot.len(), cursor, "subscriptions installed");
        Ok(SyncResponse::Subscribed {
            ids: snapshot.iter().map(|r| r.id).collect(),
            snapshot,
            cursor,
        })
    }

    pub(crate) fn handle_push(
        &self,
        id: SessionId,
        changes: Vec<OutboundChange>,
    ) -> ServerResult<SyncResponse> {
        let session = self.session(id)?;
        if changes.len() > self.config.max_push_batch as usize {
            return Err(ServerError::InvalidRequest(format!(
                "too many changes: {} > {}",
                changes.len(),
                self.config.max_push_batch
            )));
        }
        for change in &changes {
            self.check_owner(&session.principal, &change.op)?;
        }
        let Some(acked_up_to) = changes.iter().map(|c| c.seq).max() else {
            return Ok(SyncResponse::PushAck {
                acked_up_to: Default::default(),
                cursor: self.cursor(),
            });
        };

        let mut log = self.log.lock();
        let mut ops = Vec::with_capacity(changes.len());
        for change in changes {
            match &change.op {
                ChangeOp::Upsert(record) if log.tombstones.contains_key(&record.id) => {
                    debug!(node = %record.id, "ignoring upsert of deleted node");
                    continue;
                }
                ChangeOp::Upsert(_) => {}
                ChangeOp::Delete { id, at, .. } => {
                    log.tombstones.insert(*id, *at);
                }
            }
            ops.push(change.op);
        }

        let report = self.store.apply_remote(ops)?;
        let applied = report.applied.len();
        for op in report.applied {
            log.changes.append(op);
        }
        let cursor = log.changes.head();
        drop(log);

        debug!(
            session = %id,
            principal = %session.principal,
            acked = %acked_up_to,
            applied,
            cursor,
            "push applied"
        );
        Ok(SyncResponse::PushAck {
            acked_up_to,
            cursor,
        })
    }

    pub(crate) fn handle_pull(
        &self,
        id: SessionId,
        cursor: Cursor,
        limit: u32,
    ) -> ServerResult<SyncResponse> {
        let session = self.session(id)?;
        let limit = limit.clamp(1, self.config.max_pull_batch.max(1)) as usize;
        let page = self
            .log
            .lock()
            .changes
            .read(cursor, limit, |op| visible(&session, op))?;
        Ok(SyncResponse::Changes {
            changes: page.changes,
            cursor: page.cursor,
            has_more: page.has_more,
        })
    }

    pub(crate) fn handle_ack(&self, id: SessionId, cursor: Cursor) -> ServerResult<SyncResponse> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownSession(id))?;
        session.cursor = session.cursor.max(cursor);
        session.last_seen = Instant::now();
        Ok(SyncResponse::Acked)
    }

    fn check_owner(&self, principal: &OwnerId, op: &ChangeOp) -> ServerResult<()> {
        let node = op.node_id();
        if op.owner_id() != principal {
            warn!(principal = %principal, node = %node, owner = %op.owner_id(), "push for foreign owner");
            return Err(ServerError::Forbidden(format!(
                "node {node} is not owned by {principal}"
            )));
        }
        if let Some(existing) = self.store.record(node)? {
            if existing.owner_id != *principal {
                warn!(principal = %principal, node = %node, "push over foreign node");
                return Err(ServerError::Forbidden(format!(
                    "node {node} belongs to another principal"
                )));
            }
        }
        Ok(())
    }
}

impl FrameHandler for RemoteAuthority {
    fn handle_frame(&self, frame: &[u8]) -> Vec<u8> {
        let response = match decode_request(frame) {
            Ok(request) => self.handle(request),
            Err(err) => {
                debug!(error = %err, "undecodable request frame");
                SyncResponse::error(ErrorCode::BadRequest, err.to_string())
            }
        };
        encode_response(&response)
    }
}

/// Restricts `predicate` to nodes of `principal`.
fn confine(predicate: Predicate, principal: &OwnerId) -> Predicate {
    if predicate.confined_to(principal) {
        predicate
    } else {
        predicate.and(Predicate::owned_by(principal))
    }
}

fn visible(session: &Session, op: &ChangeOp) -> bool {
    if *op.owner_id() != session.principal {
        return false;
    }
    match op {
        ChangeOp::Upsert(record) => session.predicates.iter().any(|p| p.matches(record)),
        ChangeOp::Delete { .. } => !session.predicates.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use crate::{RemoteAuthority, ServerConfig};
    use treesync_core::{
        ChangeOp, ChildRef, LogicalTimestamp, Node, NodeRecord, OwnerId, Predicate,
        SequenceNumber,
    };
    use treesync_sync_protocol::{
        decode_response, encode_request, Cursor, ErrorCode, OutboundChange, SessionId,
        SyncRequest, SyncResponse, PROTOCOL_VERSION,
    };
    use std::time::Duration;
    use treesync_sync_protocol::FrameHandler;

    const APP: &str = "test-app";

    fn authority() -> RemoteAuthority {
        RemoteAuthority::new(ServerConfig::new(APP).with_max_log_entries(4)).unwrap()
    }

    fn hello(authority: &RemoteAuthority, principal: &str) -> SessionId {
        let token = authority.issue_token(principal).unwrap();
        match authority.handle(SyncRequest::Hello {
            app_id: APP.into(),
            principal: principal.into(),
            token,
            protocol_version: PROTOCOL_VERSION,
        }) {
            SyncResponse::Welcome { session, .. } => session,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn subscribe(authority: &RemoteAuthority, session: SessionId, owner: &str) -> Cursor {
        match authority.handle(SyncRequest::Subscribe {
            session,
            predicates: vec![Predicate::owned_by(&OwnerId::from(owner))],
        }) {
            SyncResponse::Subscribed { cursor, .. } => cursor,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn root(owner: &str, counter: u64) -> NodeRecord {
        NodeRecord::created_at(
            &Node::new_root(OwnerId::from(owner)),
            LogicalTimestamp::new(counter, 7),
        )
    }

    fn push(authority: &RemoteAuthority, session: SessionId, ops: Vec<ChangeOp>) -> SyncResponse {
        let changes = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| OutboundChange {
                seq: SequenceNumber::new(i as u64 + 1),
                op,
            })
            .collect();
        authority.handle(SyncRequest::Push { session, changes })
    }

    fn pull(authority: &RemoteAuthority, session: SessionId, cursor: Cursor) -> SyncResponse {
        authority.handle(SyncRequest::Pull {
            session,
            cursor,
            limit: 100,
        })
    }

    fn error_code(response: SyncResponse) -> ErrorCode {
        match response {
            SyncResponse::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn bad_token_is_unauthenticated() {
        let authority = authority();
        let response = authority.handle(SyncRequest::Hello {
            app_id: APP.into(),
            principal: "alice".into(),
            token: vec![0; 40],
            protocol_version: PROTOCOL_VERSION,
        });
        assert_eq!(error_code(response), ErrorCode::Unauthenticated);
        assert_eq!(authority.session_count(), 0);
    }

    #[test]
    fn wrong_protocol_version_is_bad_request() {
        let authority = authority();
        let token = authority.issue_token("alice").unwrap();
        let response = authority.handle(SyncRequest::Hello {
            app_id: APP.into(),
            principal: "alice".into(),
            token,
            protocol_version: PROTOCOL_VERSION + 1,
        });
        assert_eq!(error_code(response), ErrorCode::BadRequest);
    }

    #[test]
    fn anonymous_login_then_hello() {
        let authority = authority();
        let SyncResponse::Credentials { principal, token } =
            authority.handle(SyncRequest::AnonymousLogin { app_id: APP.into() })
        else {
            panic!("expected credentials");
        };
        let response = authority.handle(SyncRequest::Hello {
            app_id: APP.into(),
            principal,
            token,
            protocol_version: PROTOCOL_VERSION,
        });
        assert!(matches!(response, SyncResponse::Welcome { .. }));

        let response = authority.handle(SyncRequest::AnonymousLogin {
            app_id: "other".into(),
        });
        assert_eq!(error_code(response), ErrorCode::Unauthenticated);
    }

    #[test]
    fn foreign_push_is_forbidden() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        let response = push(&authority, alice, vec![ChangeOp::Upsert(root("bob", 1))]);
        assert_eq!(error_code(response), ErrorCode::Forbidden);
        assert!(authority.store().is_empty());
    }

    #[test]
    fn push_over_foreign_node_is_forbidden() {
        let authority = authority();
        let bob = hello(&authority, "bob");
        let record = root("bob", 1);
        push(&authority, bob, vec![ChangeOp::Upsert(record.clone())]);

        let alice = hello(&authority, "alice");
        let mut stolen = record;
        stolen.owner_id = OwnerId::from("alice");
        let response = push(&authority, alice, vec![ChangeOp::Upsert(stolen)]);
        assert_eq!(error_code(response), ErrorCode::Forbidden);
    }

    #[test]
    fn pull_is_filtered_by_principal() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        let bob = hello(&authority, "bob");
        subscribe(&authority, alice, "alice");
        subscribe(&authority, bob, "bob");

        let response = push(&authority, alice, vec![ChangeOp::Upsert(root("alice", 1))]);
        assert!(matches!(
            response,
            SyncResponse::PushAck { acked_up_to, cursor: 1 } if acked_up_to == SequenceNumber::new(1)
        ));
        push(&authority, bob, vec![ChangeOp::Upsert(root("bob", 2))]);

        let SyncResponse::Changes { changes, cursor, has_more } = pull(&authority, alice, 0) else {
            panic!("expected changes");
        };
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op.owner_id(), &OwnerId::from("alice"));
        assert_eq!(cursor, 2);
        assert!(!has_more);
    }

    #[test]
    fn unsubscribed_session_sees_nothing() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        push(&authority, alice, vec![ChangeOp::Upsert(root("alice", 1))]);
        let SyncResponse::Changes { changes, .. } = pull(&authority, alice, 0) else {
            panic!("expected changes");
        };
        assert!(changes.is_empty());
    }

    #[test]
    fn subscribe_confines_to_principal() {
        let authority = authority();
        let bob = hello(&authority, "bob");
        push(&authority, bob, vec![ChangeOp::Upsert(root("bob", 1))]);

        let alice = hello(&authority, "alice");
        push(&authority, alice, vec![ChangeOp::Upsert(root("alice", 2))]);
        let response = authority.handle(SyncRequest::Subscribe {
            session: alice,
            predicates: vec![Predicate::All],
        });
        let SyncResponse::Subscribed { ids, snapshot, cursor } = response else {
            panic!("expected snapshot");
        };
        assert_eq!(ids.len(), 1);
        assert_eq!(snapshot[0].owner_id, OwnerId::from("alice"));
        assert_eq!(cursor, 2);
    }

    #[test]
    fn tombstoned_upserts_are_ignored() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        let record = root("alice", 1);
        push(&authority, alice, vec![ChangeOp::Upsert(record.clone())]);
        push(
            &authority,
            alice,
            vec![ChangeOp::Delete {
                id: record.id,
                owner_id: record.owner_id.clone(),
                at: LogicalTimestamp::new(2, 7),
            }],
        );
        assert!(authority.store().is_empty());

        let mut late = record;
        late.text = "late".into();
        late.text_ts = LogicalTimestamp::new(3, 9);
        push(&authority, alice, vec![ChangeOp::Upsert(late)]);
        assert!(authority.store().is_empty());
        assert_eq!(authority.cursor(), 2);
    }

    #[test]
    fn children_merge_on_the_authority() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        let owner = OwnerId::from("alice");
        let base = root("alice", 1);
        push(&authority, alice, vec![ChangeOp::Upsert(base.clone())]);

        let with = |counter: u64| {
            let child = NodeRecord::created_at(
                &Node::new_child(owner.clone(), format!("c{counter}")),
                LogicalTimestamp::new(counter, counter as u32),
            );
            let mut parent = base.clone();
            parent.children.push(ChildRef {
                id: child.id,
                added: child.created,
            });
            vec![ChangeOp::Upsert(child), ChangeOp::Upsert(parent)]
        };
        push(&authority, alice, with(2));
        push(&authority, alice, with(3));

        let parent = authority.store().record(base.id).unwrap().unwrap();
        assert_eq!(parent.children.len(), 2);
    }

    #[test]
    fn unavailable_refuses_everything() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        authority.set_available(false);
        assert_eq!(error_code(pull(&authority, alice, 0)), ErrorCode::Unavailable);
        authority.set_available(true);
        assert!(matches!(pull(&authority, alice, 0), SyncResponse::Changes { .. }));
    }

    #[test]
    fn evicted_cursor_expires() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        subscribe(&authority, alice, "alice");
        for counter in 1..=6 {
            push(&authority, alice, vec![ChangeOp::Upsert(root("alice", counter))]);
        }
        assert_eq!(error_code(pull(&authority, alice, 0)), ErrorCode::CursorExpired);
        assert!(matches!(pull(&authority, alice, 2), SyncResponse::Changes { .. }));
    }

    #[test]
    fn dropped_sessions_are_unknown() {
        let authority = authority();
        let alice = hello(&authority, "alice");
        authority.drop_sessions();
        assert_eq!(error_code(pull(&authority, alice, 0)), ErrorCode::UnknownSession);
        assert_eq!(
            error_code(authority.handle(SyncRequest::Ack {
                session: alice,
                cursor: 0
            })),
            ErrorCode::UnknownSession
        );
    }

    #[test]
    fn reconnects_do_not_accumulate_sessions() {
        let authority = authority();
        let bob = hello(&authority, "bob");
        let mut last = bob;
        for _ in 0..1000 {
            last = hello(&authority, "alice");
        }
        assert_eq!(
            authority.session_count(),
            authority.config().max_sessions_per_principal + 1
        );
        assert!(matches!(pull(&authority, last, 0), SyncResponse::Changes { .. }));
        assert!(matches!(pull(&authority, bob, 0), SyncResponse::Changes { .. }));
    }

    #[test]
    fn least_recently_used_session_is_evicted() {
        let authority = RemoteAuthority::new(
            ServerConfig::new(APP).with_max_sessions_per_principal(2),
        )
        .unwrap();
        let first = hello(&authority, "alice");
        std::thread::sleep(Duration::from_millis(2));
        let second = hello(&authority, "alice");
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(pull(&authority, first, 0), SyncResponse::Changes { .. }));
        std::thread::sleep(Duration::from_millis(2));

        let third = hello(&authority, "alice");
        assert_eq!(error_code(pull(&authority, second, 0)), ErrorCode::UnknownSession);
        assert!(matches!(pull(&authority, first, 0), SyncResponse::Changes { .. }));
        assert!(matches!(pull(&authority, third, 0), SyncResponse::Changes { .. }));
    }

    #[test]
    fn idle_sessions_expire_on_the_next_hello() {
        let authority = RemoteAuthority::new(
            ServerConfig::new(APP).with_session_idle_timeout(Duration::ZERO),
        )
        .unwrap();
        let alice = hello(&authority, "alice");
        std::thread::sleep(Duration::from_millis(5));
        let bob = hello(&authority, "bob");

        assert_eq!(authority.session_count(), 1);
        assert_eq!(error_code(pull(&authority, alice, 0)), ErrorCode::UnknownSession);
        assert!(matches!(pull(&authority, bob, 0), SyncResponse::Changes { .. }));
    }

    #[test]
    fn persistent_authority_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(APP)
            .with_store_path(dir.path().join("authority"))
            .with_auth_secret(vec![9; 32]);
        let record = root("alice", 3);

        {
            let authority = RemoteAuthority::new(config.clone()).unwrap();
            let alice = hello(&authority, "alice");
            assert!(matches!(
                push(&authority, alice, vec![ChangeOp::Upsert(record.clone())]),
                SyncResponse::PushAck { .. }
            ));
            authority.close().unwrap();
        }

        let authority = RemoteAuthority::new(config).unwrap();
        let alice = hello(&authority, "alice");
        match authority.handle(SyncRequest::Subscribe {
            session: alice,
            predicates: vec![Predicate::owned_by(&OwnerId::from("alice"))],
        }) {
            SyncResponse::Subscribed { ids, snapshot, .. } => {
                assert_eq!(ids, vec![record.id]);
                assert_eq!(snapshot[0].created, record.created);
                assert!(snapshot[0].is_root);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frames_round_trip_through_the_handler() {
        let authority = authority();
        let frame = encode_request(&SyncRequest::AnonymousLogin { app_id: APP.into() }).unwrap();
        let response = decode_response(&authority.handle_frame(&frame)).unwrap();
        assert!(matches!(response, SyncResponse::Credentials { .. }));

        let garbage = decode_response(&authority.handle_frame(&[0xFF, 0x00])).unwrap();
        assert_eq!(error_code(garbage), ErrorCode::BadRequest);
    }
}
