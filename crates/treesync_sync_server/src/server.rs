//! The sync authority.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::ChangeLog;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use treesync_core::{LocalStore, LogicalTimestamp, NodeId, OwnerId, Predicate};
use treesync_sync_protocol::{Cursor, SessionId, SyncRequest, SyncResponse};

/// An authenticated client connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) principal: OwnerId,
    /// Subscriptions, each already confined to `principal`.
    pub(crate) predicates: Vec<Predicate>,
    /// Last cursor the client acknowledged.
    pub(crate) cursor: Cursor,
    pub(crate) last_seen: Instant,
}

/// State changed together with the canonical store.
#[derive(Debug)]
pub(crate) struct AuthorityLog {
    pub(crate) changes: ChangeLog,
    /// Deleted nodes; later upserts of them are ignored.
    pub(crate) tombstones: HashMap<NodeId, LogicalTimestamp>,
}

/// Reference sync authority.
///
/// Holds the canonical copy of every principal's nodes. Pushed changes are
/// merged into it with the same rules clients use, recorded in the change
/// log and served to every session whose subscriptions match.
///
/// # Example
///
/// ```rust,ignore
/// use treesync_sync_server::{RemoteAuthority, ServerConfig};
///
/// let authority = RemoteAuthority::new(ServerConfig::new("my-app"))?;
/// let token = authority.issue_token("alice")?;
/// ```
pub struct RemoteAuthority {
    pub(crate) config: ServerConfig,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) validator: TokenValidator,
    pub(crate) sessions: RwLock<HashMap<SessionId, Session>>,
    /// Held across every canonical write so the log order matches the
    /// store's commit order.
    pub(crate) log: Mutex<AuthorityLog>,
    available: AtomicBool,
}

impl RemoteAuthority {
    /// Creates an authority, opening its canonical store.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let store = match &config.store_path {
            Some(path) => LocalStore::open(path)?,
            None => LocalStore::open_in_memory()?,
        };
        let validator = TokenValidator::new(
            AuthConfig::new(config.auth_secret.clone()).with_expiry(config.token_expiry),
        );
        info!(
            app_id = %config.app_id,
            nodes = store.len(),
            persistent = config.store_path.is_some(),
            "sync authority started"
        );
        Ok(Self {
            log: Mutex::new(AuthorityLog {
                changes: ChangeLog::new(config.max_log_entries),
                tombstones: HashMap::new(),
            }),
            store: Arc::new(store),
            validator,
            sessions: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            config,
        })
    }

    /// Issues a token for `principal`.
    ///
    /// # Errors
    ///
    /// Fails if the principal is empty or the signing key is unusable.
    pub fn issue_token(&self, principal: &str) -> ServerResult<Vec<u8>> {
        if principal.trim().is_empty() {
            return Err(ServerError::InvalidRequest("empty principal".into()));
        }
        self.validator.create_token(&self.config.app_id, principal)
    }

    /// Creates a fresh anonymous principal and its token.
    ///
    /// # Errors
    ///
    /// Fails if the signing key is unusable.
    pub fn anonymous_login(&self) -> ServerResult<(String, Vec<u8>)> {
        let principal = uuid::Uuid::new_v4().to_string();
        let token = self.issue_token(&principal)?;
        debug!(principal = %principal, "issued anonymous credentials");
        Ok((principal, token))
    }

    /// Switches the authority on or off. While off, every request is
    /// answered with an unavailable error.
    pub fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) != available {
            info!(available, "authority availability changed");
        }
    }

    /// Returns true if requests are being served.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Head of the change log.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.log.lock().changes.head()
    }

    /// The canonical store.
    #[must_use]
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Forgets every session, as a restart would. Clients must reconnect.
    pub fn drop_sessions(&self) {
        let dropped = std::mem::take(&mut *self.sessions.write()).len();
        info!(dropped, "dropped all sessions");
    }

    /// Closes the canonical store.
    ///
    /// # Errors
    ///
    /// Fails if the final checkpoint cannot be written.
    pub fn close(&self) -> ServerResult<()> {
        self.set_available(false);
        self.store.close()?;
        Ok(())
    }

    /// Answers one request.
    pub fn handle(&self, request: SyncRequest) -> SyncResponse {
        let kind = request.kind();
        if !self.is_available() {
            debug!(request = kind, "refusing request while unavailable");
            return SyncResponse::error(ServerError::Unavailable.code(), "authority unavailable");
        }

        let result = match request {
            SyncRequest::AnonymousLogin { app_id } => self.handle_anonymous_login(&app_id),
            SyncRequest::Hello {
                app_id,
                principal,
                token,
                protocol_version,
            } => self.handle_hello(&app_id, &principal, &token, protocol_version),
            SyncRequest::Subscribe {
                session,
                predicates,
            } => self.handle_subscribe(session, predicates),
            SyncRequest::Push { session, changes } => self.handle_push(session, changes),
            SyncRequest::Pull {
                session,
                cursor,
                limit,
            } => self.handle_pull(session, cursor, limit),
            SyncRequest::Ack { session, cursor } => self.handle_ack(session, cursor),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                if err.is_client_error() {
                    debug!(request = kind, error = %err, "request refused");
                } else {
                    error!(request = kind, error = %err, "request failed");
                }
                SyncResponse::error(err.code(), err.to_string())
            }
        }
    }

    /// Looks up a session and marks it as used.
    pub(crate) fn session(&self, id: SessionId) -> ServerResult<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownSession(id))?;
        session.last_seen = Instant::now();
        Ok(session.clone())
    }

    /// Stores a new session for `principal`.
    ///
    /// Idle sessions of every principal are dropped first, then the
    /// principal's least recently used sessions until it is under
    /// `max_sessions_per_principal`.
    pub(crate) fn open_session(&self, principal: OwnerId, cursor: Cursor) -> SessionId {
        let now = Instant::now();
        let idle = self.config.session_idle_timeout;
        let mut sessions = self.sessions.write();

        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_seen) <= idle);
        let expired = before - sessions.len();

        let mut owned: Vec<(Instant, SessionId)> = sessions
            .iter()
            .filter(|(_, s)| s.principal == principal)
            .map(|(id, s)| (s.last_seen, *id))
            .collect();
        let limit = self.config.max_sessions_per_principal.max(1);
        let mut evicted = 0;
        if owned.len() >= limit {
            owned.sort_by_key(|(seen, _)| *seen);
            for (_, id) in owned.iter().take(owned.len() + 1 - limit) {
                sessions.remove(id);
                evicted += 1;
            }
        }
        if expired + evicted > 0 {
            debug!(expired, evicted, principal = %principal, "pruned sessions");
        }

        let id = SessionId(rand::random());
        sessions.insert(
            id,
            Session {
                principal,
                predicates: Vec::new(),
                cursor,
                last_seen: now,
            },
        );
        id
    }

    pub(crate) fn check_app(&self, app_id: &str) -> ServerResult<()> {
        if app_id != self.config.app_id {
            warn!(app_id, "request for unknown application");
            return Err(ServerError::AuthenticationFailed(format!(
                "unknown application: {app_id}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAuthority")
            .field("app_id", &self.config.app_id)
            .field("sessions", &self.session_count())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}
