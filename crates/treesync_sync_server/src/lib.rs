//! # TreeSync Sync Server
//!
//! Reference sync authority. It keeps the canonical copy of every node in
//! a [`treesync_core::LocalStore`], hands out change-log cursors and
//! enforces that principals only ever see and write their own nodes.
//!
//! The authority is transport-agnostic: it implements
//! [`treesync_sync_protocol::FrameHandler`], so any client that can carry
//! a request frame to [`FrameHandler::handle_frame`] can sync with it.
//!
//! [`FrameHandler::handle_frame`]: treesync_sync_protocol::FrameHandler::handle_frame

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use oplog::{ChangeLog, Page};
pub use server::RemoteAuthority;
