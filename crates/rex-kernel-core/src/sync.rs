//! Blocking synchronization objects
//!
//! - **Mutex**: exclusive owner, FIFO waiters, transitive priority inheritance
//! - **Event**: boolean flag with broadcast wake (`set` persists, `pulse` does not)
//! - **Semaphore**: counter with FIFO wake, one unit per waiter
//!
//! Destroying any of them completes every waiter with `SyncObjectDestroyed`.

use alloc::vec::Vec;
use log::{debug, error};

use crate::error::{KernelError, PanicReason};
use crate::list::WaitQueue;
use crate::state::Kernel;
use crate::svc::SvcResult;
use crate::types::{EventId, MutexId, Priority, ProcessId, SemId, Timeout, WaitTarget};

/// Priority-inheriting mutex
#[derive(Clone, Debug, Default)]
pub struct Mutex {
    pub owner: Option<ProcessId>,
    pub waiters: WaitQueue,
}

/// Broadcast event
#[derive(Clone, Debug, Default)]
pub struct Event {
    pub set: bool,
    pub waiters: WaitQueue,
}

/// Counting semaphore
#[derive(Clone, Debug, Default)]
pub struct Semaphore {
    pub value: u32,
    pub waiters: WaitQueue,
}

impl Kernel {
    pub(crate) fn wake_all(&mut self, waiters: Vec<ProcessId>, result: SvcResult) -> Result<(), KernelError> {
        for pid in waiters {
            self.wake_process(pid, result.clone())?;
        }
        Ok(())
    }

    // ========================================================================
    // Mutex
    // ========================================================================

    pub fn mutex_create(&mut self) -> MutexId {
        let id = MutexId(self.alloc_handle());
        self.mutexes.insert(id, Mutex::default());
        id
    }

    /// Take the mutex or park in FIFO order, boosting the owner chain.
    pub fn mutex_lock(
        &mut self,
        pid: ProcessId,
        id: MutexId,
        timeout: Timeout,
    ) -> Result<SvcResult, KernelError> {
        let owner = self.mutexes.get(&id).ok_or(KernelError::InvalidMagic)?.owner;
        match owner {
            None => {
                self.process_mut(pid)?.owned_mutexes.push(id);
                if let Some(m) = self.mutexes.get_mut(&id) {
                    m.owner = Some(pid);
                }
                Ok(SvcResult::Ok)
            }
            Some(owner) if owner == pid => {
                error!("process {} locked mutex {} it already owns", pid.0, id.0);
                Err(KernelError::Panic(PanicReason::Assertion))
            }
            Some(owner) => {
                self.sleep_process(pid, WaitTarget::Mutex(id), timeout)?;
                if let Some(m) = self.mutexes.get_mut(&id) {
                    m.waiters.push(pid);
                }
                self.update_priority_chain(owner);
                Ok(SvcResult::Blocked)
            }
        }
    }

    pub fn mutex_unlock(&mut self, pid: ProcessId, id: MutexId) -> Result<(), KernelError> {
        let m = self.mutexes.get(&id).ok_or(KernelError::InvalidMagic)?;
        if m.owner != Some(pid) {
            return Err(KernelError::AccessDenied);
        }
        self.mutex_release(id)
    }

    /// Hand the mutex to the head waiter and recompute both processes
    pub(crate) fn mutex_release(&mut self, id: MutexId) -> Result<(), KernelError> {
        let (previous, next) = match self.mutexes.get_mut(&id) {
            Some(m) => {
                let previous = m.owner.take();
                m.owner = m.waiters.pop();
                (previous, m.owner)
            }
            None => return Err(KernelError::InvalidMagic),
        };

        if let Some(prev) = previous {
            if let Some(p) = self.processes.get_mut(&prev) {
                p.owned_mutexes.retain(|m| *m != id);
            }
            self.update_priority_chain(prev);
        }
        if let Some(next) = next {
            self.process_mut(next)?.owned_mutexes.push(id);
            self.wake_process(next, SvcResult::Ok)?;
            self.update_priority_chain(next);
        }
        Ok(())
    }

    pub fn mutex_destroy(&mut self, id: MutexId) -> Result<(), KernelError> {
        let mut m = self.mutexes.remove(&id).ok_or(KernelError::InvalidMagic)?;
        let waiters = m.waiters.take_all();
        self.wake_all(waiters, SvcResult::Err(KernelError::SyncObjectDestroyed))?;
        if let Some(owner) = m.owner {
            if let Some(p) = self.processes.get_mut(&owner) {
                p.owned_mutexes.retain(|o| *o != id);
            }
            self.update_priority_chain(owner);
        }
        debug!("mutex {} destroyed", id.0);
        Ok(())
    }

    /// Base priority lowered by the waiters of every mutex the process owns
    pub fn effective_priority(&self, pid: ProcessId) -> Option<Priority> {
        let p = self.processes.get(&pid)?;
        let inherited = p
            .owned_mutexes
            .iter()
            .filter_map(|id| self.mutexes.get(id))
            .flat_map(|m| m.waiters.iter())
            .filter_map(|w| self.processes.get(&w))
            .map(|w| w.current_priority);
        Some(inherited.fold(p.base_priority, Priority::min))
    }

    /// Recompute `pid` and follow the chain of owners it is blocked behind.
    ///
    /// Stops at the first process whose effective priority is unchanged.
    /// Bounded by the process count so a lock cycle cannot spin forever.
    pub(crate) fn update_priority_chain(&mut self, pid: ProcessId) {
        let mut cur = Some(pid);
        let mut hops = self.processes.len();
        while let Some(pid) = cur {
            if hops == 0 {
                break;
            }
            hops -= 1;

            let Some(effective) = self.effective_priority(pid) else {
                break;
            };
            let Some((current, waiting)) = self
                .processes
                .get(&pid)
                .map(|p| (p.current_priority, p.waiting))
            else {
                break;
            };
            if effective == current {
                break;
            }
            self.set_current_priority(pid, effective);

            cur = match waiting {
                Some(WaitTarget::Mutex(m)) => self.mutexes.get(&m).and_then(|m| m.owner),
                _ => None,
            };
        }
    }

    // ========================================================================
    // Event
    // ========================================================================

    pub fn event_create(&mut self) -> EventId {
        let id = EventId(self.alloc_handle());
        self.events.insert(id, Event::default());
        id
    }

    /// Returns at once while the event is set, else parks
    pub fn event_wait(
        &mut self,
        pid: ProcessId,
        id: EventId,
        timeout: Timeout,
    ) -> Result<SvcResult, KernelError> {
        if self.events.get(&id).ok_or(KernelError::InvalidMagic)?.set {
            return Ok(SvcResult::Ok);
        }
        self.sleep_process(pid, WaitTarget::Event(id), timeout)?;
        if let Some(e) = self.events.get_mut(&id) {
            e.waiters.push(pid);
        }
        Ok(SvcResult::Blocked)
    }

    /// Set and wake every waiter
    pub fn event_set(&mut self, id: EventId) -> Result<(), KernelError> {
        let e = self.events.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        e.set = true;
        let waiters = e.waiters.take_all();
        self.wake_all(waiters, SvcResult::Ok)
    }

    /// Wake every waiter without setting
    pub fn event_pulse(&mut self, id: EventId) -> Result<(), KernelError> {
        let e = self.events.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        let waiters = e.waiters.take_all();
        self.wake_all(waiters, SvcResult::Ok)
    }

    pub fn event_clear(&mut self, id: EventId) -> Result<(), KernelError> {
        self.events
            .get_mut(&id)
            .ok_or(KernelError::InvalidMagic)?
            .set = false;
        Ok(())
    }

    pub fn event_is_set(&self, id: EventId) -> Result<bool, KernelError> {
        Ok(self.events.get(&id).ok_or(KernelError::InvalidMagic)?.set)
    }

    pub fn event_destroy(&mut self, id: EventId) -> Result<(), KernelError> {
        let mut e = self.events.remove(&id).ok_or(KernelError::InvalidMagic)?;
        self.wake_all(
            e.waiters.take_all(),
            SvcResult::Err(KernelError::SyncObjectDestroyed),
        )
    }

    // ========================================================================
    // Semaphore
    // ========================================================================

    pub fn sem_create(&mut self, value: u32) -> SemId {
        let id = SemId(self.alloc_handle());
        self.semaphores.insert(
            id,
            Semaphore {
                value,
                waiters: WaitQueue::new(),
            },
        );
        id
    }

    pub fn sem_wait(
        &mut self,
        pid: ProcessId,
        id: SemId,
        timeout: Timeout,
    ) -> Result<SvcResult, KernelError> {
        let s = self.semaphores.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        if s.value > 0 {
            s.value -= 1;
            return Ok(SvcResult::Ok);
        }
        self.sleep_process(pid, WaitTarget::Semaphore(id), timeout)?;
        if let Some(s) = self.semaphores.get_mut(&id) {
            s.waiters.push(pid);
        }
        Ok(SvcResult::Blocked)
    }

    /// Increment, then hand one unit to each FIFO waiter while positive
    pub fn sem_signal(&mut self, id: SemId) -> Result<(), KernelError> {
        let s = self.semaphores.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        s.value = s.value.checked_add(1).ok_or(KernelError::Overflow)?;
        let mut woken = Vec::new();
        while s.value > 0 {
            let Some(pid) = s.waiters.pop() else {
                break;
            };
            s.value -= 1;
            woken.push(pid);
        }
        self.wake_all(woken, SvcResult::Ok)
    }

    pub fn sem_get_value(&self, id: SemId) -> Result<u32, KernelError> {
        Ok(self.semaphores.get(&id).ok_or(KernelError::InvalidMagic)?.value)
    }

    pub fn sem_destroy(&mut self, id: SemId) -> Result<(), KernelError> {
        let mut s = self
            .semaphores
            .remove(&id)
            .ok_or(KernelError::InvalidMagic)?;
        self.wake_all(
            s.waiters.take_all(),
            SvcResult::Err(KernelError::SyncObjectDestroyed),
        )
    }
}
