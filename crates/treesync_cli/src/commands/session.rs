//! Opening a connection for one CLI invocation.
//!
//! The authority lives next to the local store and is reached over the
//! loopback transport, so every command goes through hello, subscribe,
//! sync and close.
//!
//! ```text
//! <store>/
//! ├─ local/          # the principal's local store
//! ├─ authority/      # canonical store of the authority
//! └─ identity.json   # anonymous credentials reused across runs
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use treesync_core::LocalStore;
use treesync_sync_engine::{
    AnonymousAuth, Connection, FramedTransport, Identity, LoopbackClient, StaticAuth, SyncConfig,
    SyncTransport,
};
use treesync_sync_server::{RemoteAuthority, ServerConfig};

pub(crate) const LOCAL_DIR: &str = "local";
pub(crate) const AUTHORITY_DIR: &str = "authority";
const IDENTITY_FILE: &str = "identity.json";

/// Tokens must survive restarts of the in-process authority.
const AUTHORITY_SECRET: &[u8; 32] = b"treesync-cli-loopback-authority!";

/// Global options shared by every command.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the local store and the authority.
    pub store: PathBuf,
    /// Application id.
    pub app_id: String,
    /// Principal to sync as; anonymous when absent.
    pub user: Option<String>,
    /// Print JSON instead of text.
    pub json: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedIdentity {
    principal: String,
    token: Vec<u8>,
}

fn load_identity(dir: &Path) -> Result<Option<Identity>, Box<dyn Error>> {
    let path = dir.join(IDENTITY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let saved: SavedIdentity = serde_json::from_slice(&fs::read(path)?)?;
    Ok(Some(Identity::new(saved.principal, saved.token)))
}

fn save_identity(dir: &Path, identity: &Identity) -> Result<(), Box<dyn Error>> {
    let saved = SavedIdentity {
        principal: identity.principal.as_str().to_string(),
        token: identity.token.clone(),
    };
    fs::create_dir_all(dir)?;
    fs::write(dir.join(IDENTITY_FILE), serde_json::to_vec_pretty(&saved)?)?;
    Ok(())
}

/// An open connection plus the authority it talks to.
pub struct Session {
    /// The principal's connection.
    pub conn: Connection,
    authority: Arc<RemoteAuthority>,
}

impl Session {
    /// Opens the authority and the local store, then connects.
    pub async fn open(options: &Options) -> Result<Self, Box<dyn Error>> {
        let authority = Arc::new(RemoteAuthority::new(
            ServerConfig::new(options.app_id.clone())
                .with_store_path(options.store.join(AUTHORITY_DIR))
                .with_auth_secret(AUTHORITY_SECRET.to_vec()),
        )?);
        let store = Arc::new(LocalStore::open(&options.store.join(LOCAL_DIR))?);
        let transport: Arc<dyn SyncTransport> =
            Arc::new(FramedTransport::new(LoopbackClient::new(authority.clone())));
        let config = SyncConfig::new(options.app_id.clone());

        let known = match &options.user {
            Some(user) => Some(Identity::new(user.as_str(), authority.issue_token(user)?)),
            None => load_identity(&options.store)?,
        };
        let conn = match known {
            Some(identity) => {
                let auth = StaticAuth::new(identity.principal, identity.token);
                Connection::open(store, transport, &auth, config).await?
            }
            None => {
                let auth = AnonymousAuth::new();
                let conn = Connection::open(store, transport, &auth, config).await?;
                if let Some(identity) = auth.identity() {
                    save_identity(&options.store, &identity)?;
                    debug!(principal = %identity.principal, "saved anonymous identity");
                }
                conn
            }
        };
        Ok(Self { conn, authority })
    }

    /// Flushes, closes the connection and then the authority.
    pub async fn close(self) -> Result<(), Box<dyn Error>> {
        self.conn.close().await?;
        self.authority.close()?;
        Ok(())
    }
}
