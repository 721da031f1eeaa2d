//! # TreeSync Sync Protocol
//!
//! Wire messages exchanged between a TreeSync client and its sync
//! authority.
//!
//! This crate provides:
//! - [`SyncRequest`] / [`SyncResponse`], one request frame answered by one
//!   response frame
//! - [`ErrorCode`] for refused requests
//! - the [`FrameHandler`] seam implemented by authorities
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod handler;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use handler::{decode_request, decode_response, encode_request, encode_response, FrameHandler};
pub use messages::{
    Cursor, ErrorCode, OutboundChange, RemoteChange, SessionId, SyncRequest, SyncResponse,
    PROTOCOL_VERSION,
};
pub use treesync_core::ChangeOp;
