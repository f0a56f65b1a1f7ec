//! Detection of same-thread viewer re-entry.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// Marks the calling thread as inside a viewer transaction.
///
/// The viewer holds an advisory file lock for the duration of a transaction.
/// A task closure that re-entered the same viewer on the same thread would
/// block on its own lock forever; construction panics when re-entry is
/// detected so the bug surfaces as a diagnostic instead of a hang.
pub(crate) struct ReentrancyGuard<'a> {
    held_by: &'a Mutex<HashSet<ThreadId>>,
    thread: ThreadId,
}

impl<'a> ReentrancyGuard<'a> {
    pub(crate) fn enter(held_by: &'a Mutex<HashSet<ThreadId>>) -> Self {
        let thread = thread::current().id();
        let mut held = held_by.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains(&thread) {
            drop(held);
            panic!(
                "deadlock detected: thread {thread:?} re-entered a database transaction \
                 while already holding the backing file lock"
            );
        }
        held.insert(thread);
        ReentrancyGuard { held_by, thread }
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.held_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.thread);
    }
}
