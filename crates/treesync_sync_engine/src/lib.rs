//! # TreeSync Sync Engine
//!
//! Client side of TreeSync replication.
//!
//! This crate provides:
//! - [`Connection`]: an explicit, principal-bound handle over a
//!   [`treesync_core::LocalStore`] with a background sync task
//! - [`SubscriptionManager`]: the predicates a connection replicates
//! - the connection state machine
//!   (`Connecting → Subscribing → Syncing → Steady`, plus `Error` and `Closed`)
//! - transports ([`FramedTransport`], [`LoopbackClient`]) and authentication
//!   providers ([`StaticAuth`], [`AnonymousAuth`])
//!
//! ## Cycle
//!
//! Each sync cycle pulls remote changes first and merges them into the
//! local store, then pushes pending local changes in sequence order, then
//! acknowledges the pulled cursor. After every (re)connect the
//! subscriptions are installed again and the local store is reconciled
//! against the authority's snapshot.
//!
//! ## Failures
//!
//! Transport failures reconnect with exponential backoff. Authentication
//! and protocol failures are terminal. Neither ever unwinds a caller's
//! transaction; both are reported on [`Connection::errors`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod connection;
mod engine;
mod error;
mod state;
mod subscriptions;
mod transport;

pub use auth::{AnonymousAuth, AuthProvider, Identity, StaticAuth};
pub use config::{RetryConfig, SyncConfig};
pub use connection::Connection;
pub use error::{FailureKind, SyncError, SyncFailure, SyncResult};
pub use state::{ConnectionState, SyncCycleResult, SyncStats};
pub use subscriptions::{SubscriptionId, SubscriptionManager};
pub use transport::{FrameClient, FramedTransport, LoopbackClient, SyncTransport};
