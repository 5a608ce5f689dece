//! Scheduler and waiter lists
//!
//! Both lists hold process IDs, never references: a process is looked up in
//! the process table when its entry is reached.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::types::{Priority, ProcessId};

/// Runnable processes ordered by priority, FIFO among equals.
///
/// The head is the process that should run. Each entry caches the priority
/// it was inserted with; a priority change is a remove plus insert.
#[derive(Clone, Debug, Default)]
pub struct ReadyList {
    entries: VecDeque<(ProcessId, Priority)>,
}

impl ReadyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<ProcessId> {
        self.entries.front().map(|(pid, _)| *pid)
    }

    /// Insert before the first entry of strictly lower importance
    pub fn insert(&mut self, pid: ProcessId, priority: Priority) {
        let at = self
            .entries
            .iter()
            .position(|(_, p)| priority.is_more_important(*p))
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (pid, priority));
    }

    pub fn remove(&mut self, pid: ProcessId) -> bool {
        match self.entries.iter().position(|(p, _)| *p == pid) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.entries.iter().any(|(p, _)| *p == pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, Priority)> + '_ {
        self.entries.iter().copied()
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.entries.iter().map(|(pid, _)| *pid).collect()
    }
}

/// FIFO list of processes parked on one object
#[derive(Clone, Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<ProcessId>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pid: ProcessId) {
        self.waiters.push_back(pid);
    }

    pub fn pop(&mut self) -> Option<ProcessId> {
        self.waiters.pop_front()
    }

    pub fn remove(&mut self, pid: ProcessId) -> bool {
        match self.waiters.iter().position(|p| *p == pid) {
            Some(at) => {
                self.waiters.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.waiters.contains(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.waiters.iter().copied()
    }

    /// Empty the queue, returning waiters in FIFO order
    pub fn take_all(&mut self) -> Vec<ProcessId> {
        self.waiters.drain(..).collect()
    }
}

// ============================================================================
// Kani proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    #[kani::proof]
    #[kani::unwind(5)]
    fn ready_list_stays_sorted() {
        let mut list = ReadyList::new();
        for i in 0..3u32 {
            let prio: u8 = kani::any();
            list.insert(ProcessId(i + 1), Priority(prio));
        }
        let prios: Vec<Priority> = list.iter().map(|(_, p)| p).collect();
        assert!(prios.windows(2).all(|w| w[0] <= w[1]));
    }
}
