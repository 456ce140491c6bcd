// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The flow entry lifecycle.
//!
//! ```text
//!              AddOk         RemoveIssued          RemoveDone
//!   PendingAdd -------> Active ------------> PendingDelete ------> Deleted
//!       |                 |                                          ^
//!       | AddFailed       | Aged                                     |
//!       +-----------------+------------------------------------------+
//! ```
//!
//! Hardware operations complete asynchronously. Each one issued for a
//! flow carries a [`PendingOp`]: a shared completion token which the
//! offload engine hands back in its completion, and which points back
//! at the flow through a typed [`EntryHandle`].

use super::flow_table::EntryHandle;
use crate::api::EntryState;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::AcqRel;
use core::sync::atomic::Ordering::Acquire;
use core::sync::atomic::Ordering::Release;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

/// An input to the entry state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleEvent {
    AddOk,
    AddFailed,
    RemoveIssued,
    /// The removal completed, successfully or not. Either way the
    /// flow no longer owns a rule.
    RemoveDone,
    Aged,
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AddOk => "add-ok",
            Self::AddFailed => "add-failed",
            Self::RemoveIssued => "remove-issued",
            Self::RemoveDone => "remove-done",
            Self::Aged => "aged",
        };
        write!(f, "{s}")
    }
}

/// Compute the state `state` moves to on `ev`, or `None` if the
/// event is not valid in that state.
pub fn transition(state: EntryState, ev: LifecycleEvent) -> Option<EntryState> {
    use EntryState::*;
    use LifecycleEvent::*;

    match (state, ev) {
        (PendingAdd, AddOk) => Some(Active),
        (PendingAdd, AddFailed) => Some(Deleted),
        (Active, RemoveIssued) => Some(PendingDelete),
        (Active, Aged) => Some(Deleted),
        (PendingDelete, RemoveDone) => Some(Deleted),
        _ => None,
    }
}

/// The outcome of resolving one sub-operation of a [`PendingOp`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// Other sub-operations are still outstanding.
    Pending,

    /// This was the last outstanding sub-operation. Reported exactly
    /// once per token.
    Released { failed: bool },

    /// The token had already been released. This is an engine bug.
    Stale,
}

/// The completion token of an asynchronous hardware operation.
///
/// A token may cover several sub-operations issued together (such as
/// the entries of a control stage) and is released when the last of
/// them resolves. Any failed sub-operation marks the whole batch as
/// failed; it never holds up other batches.
#[derive(Debug)]
pub struct PendingOp {
    entry: Option<EntryHandle>,
    outstanding: AtomicU32,
    failed: AtomicBool,
    released: AtomicBool,
}

impl PendingOp {
    pub fn new(entry: Option<EntryHandle>, count: u32) -> Arc<Self> {
        Arc::new(Self {
            entry,
            outstanding: AtomicU32::new(count),
            failed: AtomicBool::new(false),
            released: AtomicBool::new(count == 0),
        })
    }

    /// A token for a single operation on behalf of `entry`.
    pub fn for_entry(entry: EntryHandle) -> Arc<Self> {
        Self::new(Some(entry), 1)
    }

    /// The flow this operation was issued for, if any.
    pub fn entry(&self) -> Option<EntryHandle> {
        self.entry
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Release);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Acquire)
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Acquire)
    }

    /// Resolve one sub-operation.
    pub fn resolve(&self, ok: bool) -> Resolution {
        if !ok {
            self.mark_failed();
        }

        let prev = self
            .outstanding
            .fetch_update(AcqRel, Acquire, |n| n.checked_sub(1));

        match prev {
            Ok(1) => {
                if self.released.swap(true, AcqRel) {
                    Resolution::Stale
                } else {
                    Resolution::Released { failed: self.failed() }
                }
            }
            Ok(_) => Resolution::Pending,
            Err(_) => Resolution::Stale,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use EntryState::*;
    use LifecycleEvent::*;

    #[test]
    fn valid_transitions() {
        assert_eq!(transition(PendingAdd, AddOk), Some(Active));
        assert_eq!(transition(PendingAdd, AddFailed), Some(Deleted));
        assert_eq!(transition(Active, RemoveIssued), Some(PendingDelete));
        assert_eq!(transition(PendingDelete, RemoveDone), Some(Deleted));
        assert_eq!(transition(Active, Aged), Some(Deleted));
    }

    #[test]
    fn no_exit_from_deleted() {
        for ev in [AddOk, AddFailed, RemoveIssued, RemoveDone, Aged] {
            assert_eq!(transition(Deleted, ev), None, "{ev}");
        }
    }

    #[test]
    fn no_delete_while_add_outstanding() {
        assert_eq!(transition(PendingAdd, RemoveIssued), None);
        assert_eq!(transition(PendingAdd, Aged), None);
        assert_eq!(transition(PendingDelete, Aged), None);
    }

    #[test]
    fn batch_countdown_releases_once() {
        let op = PendingOp::new(None, 4);
        assert_eq!(op.resolve(true), Resolution::Pending);
        assert_eq!(op.resolve(false), Resolution::Pending);
        assert_eq!(op.resolve(true), Resolution::Pending);
        assert!(!op.is_released());
        assert_eq!(op.resolve(true), Resolution::Released { failed: true });
        assert!(op.is_released());
        assert_eq!(op.resolve(true), Resolution::Stale);
        assert_eq!(op.outstanding(), 0);
    }

    #[test]
    fn concurrent_resolution_releases_once() {
        let op = PendingOp::new(None, 64);
        let released: u32 = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let op = &op;
                    s.spawn(move || {
                        (0..8)
                            .filter(|_| {
                                matches!(
                                    op.resolve(true),
                                    Resolution::Released { .. }
                                )
                            })
                            .count() as u32
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(released, 1);
    }
}
