//! # TreeSync Core
//!
//! Embedded storage for owner-scoped node trees that replicate through a
//! sync authority.
//!
//! This crate provides:
//! - [`LocalStore`]: object table, write-ahead log, snapshots and the
//!   pending outbound change log
//! - [`NodeGraph`]: root creation, child appends and cascading deletes
//! - [`ChangeFeed`] and the notification bus for in-process observers
//! - the deterministic merge rules applied to remote changes
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use treesync_core::{LocalStore, NodeGraph, OwnerId};
//!
//! let graph = NodeGraph::new(Arc::new(LocalStore::open_in_memory()?));
//! let owner = OwnerId::from("alice");
//! let child = graph.add_to_root("hello", &owner)?;
//! assert_eq!(graph.info(&owner)?.root_children, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod change_feed;
mod config;
mod dir;
mod error;
mod graph;
pub mod log;
pub mod merge;
mod node;
mod outbound;
mod query;
mod store;
mod types;

pub use bus::{CollectionChange, NotificationBus, ObjectChange, ObserverToken};
pub use change_feed::{ChangeFeed, ChangeKind, ChangeOrigin, ChangeRecord, WatchId};
pub use config::StoreConfig;
pub use dir::{store_files, StoreDir};
pub use error::{CoreError, CoreResult};
pub use graph::{NodeGraph, OwnerInfo, TreeEntry, TreeView};
pub use log::{inspect, LogStats};
pub use merge::{merge_records, ConflictKind, ConflictResolved, MergeOutcome, PendingEdits, Winner};
pub use node::{ChildRef, Node, NodeField, NodeRecord};
pub use outbound::{OutboundLog, PendingChange, PendingKind};
pub use query::Predicate;
pub use store::{ApplyReport, ChangeOp, LocalStore, WriteTxn};
pub use types::{LogicalTimestamp, NodeId, OwnerId, ReplicaId, SequenceNumber};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
