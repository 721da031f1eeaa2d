//! Token authentication for the sync authority.
//!
//! Tokens are bound to an application id and a principal and signed with
//! HMAC-SHA256:
//!
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: signature over `len(app_id) | app_id | len(principal) | principal | issued_at`
//!
//! Total: 40 bytes. The principal travels next to the token, not inside it.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 40;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    #[must_use]
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks principal tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `principal` in `app_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if the signing key is unusable.
    pub fn create_token(&self, app_id: &str, principal: &str) -> ServerResult<Vec<u8>> {
        self.create_token_at(app_id, principal, now_millis())
    }

    pub(crate) fn create_token_at(
        &self,
        app_id: &str,
        principal: &str,
        issued_at: u64,
    ) -> ServerResult<Vec<u8>> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&issued_at.to_be_bytes());
        token.extend_from_slice(&self.sign(app_id, principal, issued_at)?);
        Ok(token)
    }

    /// Checks that `token` was issued by this authority to `principal` in
    /// `app_id` and has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AuthenticationFailed`] otherwise.
    pub fn validate_token(&self, token: &[u8], app_id: &str, principal: &str) -> ServerResult<()> {
        if token.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }
        let (stamp, signature) = token.split_at(8);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(stamp);
        let issued_at = u64::from_be_bytes(issued);

        self.mac(app_id, principal, issued_at)?
            .verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let expiry = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_millis() > issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }
        Ok(())
    }

    fn sign(&self, app_id: &str, principal: &str, issued_at: u64) -> ServerResult<[u8; 32]> {
        Ok(self
            .mac(app_id, principal, issued_at)?
            .finalize()
            .into_bytes()
            .into())
    }

    fn mac(&self, app_id: &str, principal: &str, issued_at: u64) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("signing key: {e}")))?;
        for part in [app_id.as_bytes(), principal.as_bytes()] {
            mac.update(&(part.len() as u32).to_be_bytes());
            mac.update(part);
        }
        mac.update(&issued_at.to_be_bytes());
        Ok(mac)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
