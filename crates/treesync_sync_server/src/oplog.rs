//! Bounded change log the authority serves pulls from.

use crate::error::{ServerError, ServerResult};
use std::collections::VecDeque;
use treesync_core::ChangeOp;
use treesync_sync_protocol::{Cursor, RemoteChange};

/// Ordered log of applied changes, addressed by cursor.
///
/// Cursors start at 1 and increase by one per change. Once more than
/// `max_entries` changes are held the oldest are evicted, and a pull from
/// before the eviction point fails with [`ServerError::CursorExpired`].
#[derive(Debug)]
pub struct ChangeLog {
    entries: VecDeque<RemoteChange>,
    next_cursor: Cursor,
    evicted_up_to: Cursor,
    max_entries: usize,
}

/// One page of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Matching changes.
    pub changes: Vec<RemoteChange>,
    /// Cursor of the last examined entry.
    pub cursor: Cursor,
    /// Whether unexamined entries remain.
    pub has_more: bool,
}

impl ChangeLog {
    /// Creates an empty log retaining at most `max_entries` changes.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_cursor: 1,
            evicted_up_to: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Appends a change and returns its cursor.
    pub fn append(&mut self, op: ChangeOp) -> Cursor {
        let cursor = self.next_cursor;
        self.next_cursor += 1;
        self.entries.push_back(RemoteChange { cursor, op });
        while self.entries.len() > self.max_entries {
            if let Some(evicted) = self.entries.pop_front() {
                self.evicted_up_to = evicted.cursor;
            }
        }
        cursor
    }

    /// Cursor of the newest change, 0 when empty.
    #[must_use]
    pub fn head(&self) -> Cursor {
        self.next_cursor - 1
    }

    /// Number of retained changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads up to `limit` changes after `after` that pass `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::CursorExpired`] if changes after `after` have
    /// already been evicted.
    pub fn read<F>(&self, after: Cursor, limit: usize, filter: F) -> ServerResult<Page>
    where
        F: Fn(&ChangeOp) -> bool,
    {
        if after < self.evicted_up_to {
            return Err(ServerError::CursorExpired {
                requested: after,
                oldest: self.evicted_up_to,
            });
        }

        let mut changes = Vec::new();
        let mut cursor = after.min(self.head());
        for entry in self.entries.iter().filter(|e| e.cursor > after) {
            if changes.len() >= limit {
                break;
            }
            cursor = entry.cursor;
            if filter(&entry.op) {
                changes.push(entry.clone());
            }
        }
        Ok(Page {
            changes,
            cursor,
            has_more: cursor < self.head(),
        })
    }
}
