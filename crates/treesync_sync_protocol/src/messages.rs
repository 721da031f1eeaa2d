//! Protocol messages for sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use treesync_core::{ChangeOp, NodeId, NodeRecord, Predicate, SequenceNumber};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Position in the authority's change log.
pub type Cursor = u64;

/// Identifies an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A pending local change sent to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChange {
    /// Sequence number in the client's outbound log.
    pub seq: SequenceNumber,
    /// The change.
    pub op: ChangeOp,
}

/// A change read from the authority's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Cursor of the change.
    pub cursor: Cursor,
    /// The change.
    pub op: ChangeOp,
}

/// Why the authority refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Credentials are missing, invalid or expired.
    Unauthenticated,
    /// The request touches data of another principal.
    Forbidden,
    /// The request is malformed or unsupported.
    BadRequest,
    /// The session is unknown, e.g. after an authority restart.
    UnknownSession,
    /// The authority is temporarily unavailable.
    Unavailable,
    /// The requested cursor is older than the retained change log.
    CursorExpired,
}

impl ErrorCode {
    /// Returns true if retrying after reconnecting can succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownSession | ErrorCode::Unavailable | ErrorCode::CursorExpired
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::UnknownSession => "unknown session",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::CursorExpired => "cursor expired",
        };
        f.write_str(name)
    }
}

/// A request from client to authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Asks for fresh anonymous credentials.
    AnonymousLogin {
        /// Application the client belongs to.
        app_id: String,
    },
    /// Opens a session.
    Hello {
        /// Application the client belongs to.
        app_id: String,
        /// Principal the token was issued to.
        principal: String,
        /// Signed token.
        token: Vec<u8>,
        /// Client protocol version.
        protocol_version: u16,
    },
    /// Replaces the session's subscriptions and asks for a snapshot.
    Subscribe {
        /// Session.
        session: SessionId,
        /// Predicates; the authority confines each to the principal.
        predicates: Vec<Predicate>,
    },
    /// Sends pending local changes in sequence order.
    Push {
        /// Session.
        session: SessionId,
        /// Changes to apply.
        changes: Vec<OutboundChange>,
    },
    /// Reads subscribed changes after `cursor`.
    Pull {
        /// Session.
        session: SessionId,
        /// Last cursor the client has applied.
        cursor: Cursor,
        /// Maximum number of changes to return.
        limit: u32,
    },
    /// Confirms the client applied everything up to `cursor`.
    Ack {
        /// Session.
        session: SessionId,
        /// Applied cursor.
        cursor: Cursor,
    },
}

impl SyncRequest {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncRequest::AnonymousLogin { .. } => "anonymous_login",
            SyncRequest::Hello { .. } => "hello",
            SyncRequest::Subscribe { .. } => "subscribe",
            SyncRequest::Push { .. } => "push",
            SyncRequest::Pull { .. } => "pull",
            SyncRequest::Ack { .. } => "ack",
        }
    }

    /// Session the request belongs to, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            SyncRequest::AnonymousLogin { .. } | SyncRequest::Hello { .. } => None,
            SyncRequest::Subscribe { session, .. }
            | SyncRequest::Push { session, .. }
            | SyncRequest::Pull { session, .. }
            | SyncRequest::Ack { session, .. } => Some(*session),
        }
    }
}

/// A response from authority to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    /// Anonymous credentials.
    Credentials {
        /// Newly created principal.
        principal: String,
        /// Token for that principal.
        token: Vec<u8>,
    },
    /// Session opened.
    Welcome {
        /// New session.
        session: SessionId,
        /// Head of the change log.
        cursor: Cursor,
    },
    /// Subscriptions installed.
    Subscribed {
        /// Ids of every visible node matching the predicates.
        ids: Vec<NodeId>,
        /// Their current state.
        snapshot: Vec<NodeRecord>,
        /// Head of the change log when the snapshot was taken.
        cursor: Cursor,
    },
    /// Pushed changes were applied.
    PushAck {
        /// Highest client sequence number applied.
        acked_up_to: SequenceNumber,
        /// Head of the change log after the push.
        cursor: Cursor,
    },
    /// Changes after the requested cursor.
    Changes {
        /// Matching changes in cursor order.
        changes: Vec<RemoteChange>,
        /// Cursor to pull from next.
        cursor: Cursor,
        /// Whether more changes are waiting.
        has_more: bool,
    },
    /// Acknowledgement recorded.
    Acked,
    /// The request was refused.
    Error {
        /// Reason class.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl SyncResponse {
    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncResponse::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncResponse::Credentials { .. } => "credentials",
            SyncResponse::Welcome { .. } => "welcome",
            SyncResponse::Subscribed { .. } => "subscribed",
            SyncResponse::PushAck { .. } => "push_ack",
            SyncResponse::Changes { .. } => "changes",
            SyncResponse::Acked => "acked",
            SyncResponse::Error { .. } => "error",
        }
    }
}
