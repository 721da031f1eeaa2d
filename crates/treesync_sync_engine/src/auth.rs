//! Authentication providers.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use treesync_core::OwnerId;
use treesync_sync_protocol::{ErrorCode, ProtocolError, SyncRequest, SyncResponse};

/// An authenticated principal and the token proving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable principal id; becomes the owner of every node written.
    pub principal: OwnerId,
    /// Token presented in `Hello`.
    pub token: Vec<u8>,
}

impl Identity {
    /// Creates an identity.
    pub fn new(principal: impl Into<OwnerId>, token: Vec<u8>) -> Self {
        Self {
            principal: principal.into(),
            token,
        }
    }
}

/// Produces the identity a connection syncs as.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolves the identity, possibly by asking the authority.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AuthFailed`] if no principal can be resolved.
    async fn authenticate(&self, transport: &dyn SyncTransport, app_id: &str)
        -> SyncResult<Identity>;
}

/// A fixed principal and token.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    identity: Identity,
}

impl StaticAuth {
    /// Uses `principal` with `token`.
    pub fn new(principal: impl Into<OwnerId>, token: Vec<u8>) -> Self {
        Self {
            identity: Identity::new(principal, token),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn authenticate(&self, _: &dyn SyncTransport, _: &str) -> SyncResult<Identity> {
        if self.identity.principal.is_empty() {
            return Err(SyncError::AuthFailed("empty principal".into()));
        }
        Ok(self.identity.clone())
    }
}

/// Anonymous credentials issued by the authority.
///
/// The first successful login is remembered, so every later
/// authentication through the same provider yields the same principal.
#[derive(Debug, Default)]
pub struct AnonymousAuth {
    cached: Mutex<Option<Identity>>,
}

impl AnonymousAuth {
    /// Creates a provider that has not logged in yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The remembered identity, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.cached.lock().clone()
    }
}

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn authenticate(
        &self,
        transport: &dyn SyncTransport,
        app_id: &str,
    ) -> SyncResult<Identity> {
        if let Some(identity) = self.identity() {
            return Ok(identity);
        }
        let response = transport
            .request(SyncRequest::AnonymousLogin {
                app_id: app_id.to_string(),
            })
            .await
            .map_err(|err| match err {
                SyncError::Rejected {
                    code: ErrorCode::Unauthenticated,
                    message,
                } => SyncError::AuthFailed(message),
                other => other,
            })?;
        match response {
            SyncResponse::Credentials { principal, token } => {
                debug!(principal = %principal, "logged in anonymously");
                let identity = Identity::new(principal, token);
                *self.cached.lock() = Some(identity.clone());
                Ok(identity)
            }
            other => Err(ProtocolError::UnexpectedResponse {
                expected: "credentials",
                actual: other.kind(),
            }
            .into()),
        }
    }
}
