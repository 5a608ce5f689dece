//! Process manager
//!
//! Process lifecycle, the ready list, and the two primitives every blocking
//! operation funnels through: `sleep_process` parks the caller on a wait
//! target, `wake_process` completes a parked call with its result.

use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, trace, warn};

use crate::error::{KernelError, PanicReason};
use crate::ipc::IpcQueue;
use crate::pool::{Pool, PoolError, Region};
use crate::state::Kernel;
use crate::svc::SvcResult;
use crate::timer::{TimerAction, TimerKey};
use crate::types::{
    MutexId, Priority, ProcessId, ProcessInfo, ProcessState, RexDescriptor, StreamDir, Timeout,
    WaitTarget, REX_FLAG_ACTIVE,
};

/// Smallest process memory accepted by `process_create`
pub const MIN_PROCESS_SIZE: usize = 64;

/// Process descriptor
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub flags: u32,
    /// Priority assigned at creation or by `set_priority`
    pub base_priority: Priority,
    /// Effective priority including inheritance
    pub current_priority: Priority,
    pub ipc: IpcQueue,
    /// Private pool over the process memory
    pub heap: Pool<Region>,
    /// Start of the process memory (system pool address)
    pub region: usize,
    pub size: usize,
    pub(crate) pool_index: usize,
    /// Saved stack pointer, the growth boundary of the private pool
    pub stack_pointer: usize,
    pub waiting: Option<WaitTarget>,
    pub(crate) timeout: Option<TimerKey>,
    pub owned_mutexes: Vec<MutexId>,
    pub last_error: Option<KernelError>,
    /// Result of a blocking call that completed while parked
    pub resume: Option<SvcResult>,
}

impl Process {
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state,
            base_priority: self.base_priority,
            current_priority: self.current_priority,
            ipc_pending: self.ipc.len(),
            ipc_capacity: self.ipc.capacity(),
            heap: self.heap.stats(),
        }
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.region && end <= self.region + self.size,
            None => false,
        }
    }
}

impl Kernel {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a process from its descriptor.
    ///
    /// Its memory comes from the first system pool that fits.
    pub fn process_create(&mut self, rex: &RexDescriptor) -> Result<ProcessId, KernelError> {
        if rex.name.is_empty()
            || rex.size < MIN_PROCESS_SIZE
            || rex.ipc_size == 0
            || rex.ipc_size > self.config.max_ipc_size
        {
            return Err(KernelError::InvalidParams);
        }

        let (pool_index, region) = self.alloc_system(rex.size)?;
        let heap = match Pool::new(region, Region::zeroed(rex.size), self.config.pool_guards) {
            Ok(heap) => heap,
            Err(e) => {
                self.free_system(pool_index, region)?;
                return Err(e.into());
            }
        };

        let pid = ProcessId(self.alloc_handle());
        let active = rex.flags & REX_FLAG_ACTIVE != 0;
        self.processes.insert(
            pid,
            Process {
                pid,
                name: rex.name.clone(),
                state: if active {
                    ProcessState::Active
                } else {
                    ProcessState::Frozen
                },
                flags: rex.flags,
                base_priority: rex.priority,
                current_priority: rex.priority,
                ipc: IpcQueue::new(rex.ipc_size),
                heap,
                region,
                size: rex.size,
                pool_index,
                stack_pointer: region + rex.size,
                waiting: None,
                timeout: None,
                owned_mutexes: Vec::new(),
                last_error: None,
                resume: None,
            },
        );
        if active {
            self.ready_insert(pid);
        }

        debug!(
            "process {} '{}' created at {:#x} ({} bytes, prio {})",
            pid.0, rex.name, region, rex.size, rex.priority.0
        );
        Ok(pid)
    }

    /// Destroy a process, unlinking it from everything it takes part in.
    pub fn process_destroy(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        if pid == self.root() {
            return Err(KernelError::Panic(PanicReason::RootProcessDestroyed));
        }
        let (waiting, timeout, owned) = {
            let p = self.process_mut(pid)?;
            // never runnable again, so priority updates below leave the ready list alone
            p.state = ProcessState::Frozen;
            (p.waiting.take(), p.timeout.take(), core::mem::take(&mut p.owned_mutexes))
        };

        if let Some(target) = waiting {
            self.unlink_waiter(pid, target);
        }
        if let Some(key) = timeout {
            self.timers.remove(key);
        }
        self.ready_remove(pid);

        // tear everything down first, report the first failure at the end
        let mut failed = None;
        for mutex in owned {
            if let Err(e) = self.mutex_release(mutex) {
                failed.get_or_insert(e);
            }
        }
        let timers: Vec<_> = self
            .soft_timers
            .iter()
            .filter(|(_, t)| t.owner == pid)
            .map(|(id, _)| *id)
            .collect();
        for id in timers {
            self.soft_timer_remove(id);
        }
        let handles: Vec<_> = self
            .stream_handles
            .iter()
            .filter(|(_, b)| b.pid == pid)
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            self.stream_unbind(handle);
        }
        if let Err(e) = self.block_release_process(pid) {
            failed.get_or_insert(e);
        }

        if let Some(p) = self.processes.remove(&pid) {
            if let Err(e) = self.free_system(p.pool_index, p.region) {
                failed.get_or_insert(e);
            }
            debug!("process {} '{}' destroyed", pid.0, p.name);
        }
        if self.running == Some(pid) {
            self.running = None;
            self.pend_switch();
        }
        self.reprogram_hpet();
        failed.map_or(Ok(()), Err)
    }

    /// Fault attribution: a faulting process is destroyed alone, anything
    /// else is fatal.
    pub fn on_fault(&mut self, pid: Option<ProcessId>) -> Result<(), KernelError> {
        match pid {
            None => Err(KernelError::Panic(PanicReason::UnattributedFault)),
            Some(pid) if pid == self.root() => {
                Err(KernelError::Panic(PanicReason::RootProcessDestroyed))
            }
            Some(pid) => {
                warn!("process {} faulted, destroying it", pid.0);
                self.process_destroy(pid)
            }
        }
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// Effective priority
    pub fn process_get_priority(&self, pid: ProcessId) -> Result<Priority, KernelError> {
        Ok(self.process(pid)?.current_priority)
    }

    pub fn process_set_priority(&mut self, pid: ProcessId, priority: Priority) -> Result<(), KernelError> {
        self.process_mut(pid)?.base_priority = priority;
        self.update_priority_chain(pid);
        Ok(())
    }

    pub fn process_get_flags(&self, pid: ProcessId) -> Result<u32, KernelError> {
        Ok(self.process(pid)?.flags)
    }

    /// Freeze or thaw a process. Freezing keeps any wait in place.
    pub fn process_set_flags(&mut self, pid: ProcessId, flags: u32) -> Result<(), KernelError> {
        let active = flags & REX_FLAG_ACTIVE != 0;
        if pid == self.root() && !active {
            return Err(KernelError::AccessDenied);
        }
        let p = self.process_mut(pid)?;
        p.flags = flags;
        let (next, runnable) = match (p.state, active) {
            (ProcessState::Frozen, true) => (ProcessState::Active, Some(true)),
            (ProcessState::Active, false) => (ProcessState::Frozen, Some(false)),
            (ProcessState::WaitingFrozen, true) => (ProcessState::Waiting, None),
            (ProcessState::Waiting, false) => (ProcessState::WaitingFrozen, None),
            (state, _) => (state, None),
        };
        p.state = next;
        match runnable {
            Some(true) => self.ready_insert(pid),
            Some(false) => self.ready_remove(pid),
            None => {}
        }
        Ok(())
    }

    pub fn process_get_name(&self, pid: ProcessId) -> Result<&str, KernelError> {
        Ok(&self.process(pid)?.name)
    }

    pub fn last_error(&self, pid: ProcessId) -> Result<Option<KernelError>, KernelError> {
        Ok(self.process(pid)?.last_error)
    }

    /// Record the outcome of a call rejected before dispatch
    pub fn set_last_error(&mut self, pid: ProcessId, err: Option<KernelError>) -> Result<(), KernelError> {
        self.process_mut(pid)?.last_error = err;
        Ok(())
    }

    /// Validate that `[addr, addr + len)` is memory the process may touch:
    /// its own region or a block it holds mapped.
    pub fn check_address(&self, pid: ProcessId, addr: usize, len: usize) -> Result<(), KernelError> {
        let p = self.process(pid)?;
        if p.contains(addr, len) || self.block_mapped_for(pid, addr, len) {
            Ok(())
        } else {
            Err(KernelError::AccessDenied)
        }
    }

    /// Update the saved stack pointer bounding private pool growth
    pub fn set_stack_pointer(&mut self, pid: ProcessId, sp: usize) -> Result<(), KernelError> {
        let p = self.process_mut(pid)?;
        if sp < p.region || sp > p.region + p.size {
            return Err(KernelError::InvalidParams);
        }
        p.stack_pointer = sp;
        Ok(())
    }

    // ========================================================================
    // Private pool
    // ========================================================================

    pub fn process_malloc(&mut self, pid: ProcessId, size: usize) -> Result<usize, KernelError> {
        let p = self.process_mut(pid)?;
        let boundary = p.stack_pointer;
        p.heap.allocate(size, boundary).map_err(|e| heap_error(pid, e))
    }

    /// Null is accepted and ignored
    pub fn process_free(&mut self, pid: ProcessId, addr: usize) -> Result<(), KernelError> {
        let p = self.process_mut(pid)?;
        if addr == 0 {
            return Ok(());
        }
        p.heap.free(addr).map_err(|e| heap_error(pid, e))
    }

    /// Null behaves as malloc
    pub fn process_realloc(&mut self, pid: ProcessId, addr: usize, size: usize) -> Result<usize, KernelError> {
        if addr == 0 {
            return self.process_malloc(pid, size);
        }
        let p = self.process_mut(pid)?;
        let boundary = p.stack_pointer;
        p.heap
            .realloc(addr, size, boundary)
            .map_err(|e| heap_error(pid, e))
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Promote the ready head to running.
    ///
    /// Returns `(from, to)` when the running process changes.
    pub fn schedule(&mut self) -> Option<(Option<ProcessId>, ProcessId)> {
        let next = self.ready.head()?;
        if self.running == Some(next) {
            return None;
        }
        let from = self.running.replace(next);
        trace!("switch {:?} -> {}", from.map(|p| p.0), next.0);
        Some((from, next))
    }

    pub(crate) fn ready_insert(&mut self, pid: ProcessId) {
        let Some(priority) = self.processes.get(&pid).map(|p| p.current_priority) else {
            return;
        };
        let before = self.ready.head();
        self.ready.insert(pid, priority);
        if self.ready.head() != before {
            self.pend_switch();
        }
    }

    pub(crate) fn ready_remove(&mut self, pid: ProcessId) {
        let was_head = self.ready.head() == Some(pid);
        if self.ready.remove(pid) && was_head {
            self.pend_switch();
        }
    }

    /// Change the effective priority, repositioning a runnable process
    pub(crate) fn set_current_priority(&mut self, pid: ProcessId, priority: Priority) {
        let Some(p) = self.processes.get_mut(&pid) else {
            return;
        };
        p.current_priority = priority;
        if p.state == ProcessState::Active {
            let before = self.ready.head();
            self.ready.remove(pid);
            self.ready.insert(pid, priority);
            if self.ready.head() != before {
                self.pend_switch();
            }
        }
        trace!("process {} priority now {}", pid.0, priority.0);
    }

    // ========================================================================
    // Sleep / wake
    // ========================================================================

    /// Park an active process on `target`, optionally with a deadline.
    pub fn sleep_process(
        &mut self,
        pid: ProcessId,
        target: WaitTarget,
        timeout: Timeout,
    ) -> Result<(), KernelError> {
        let p = self.process_mut(pid)?;
        if p.state != ProcessState::Active {
            return Err(KernelError::NotActive);
        }
        p.state = ProcessState::Waiting;
        p.waiting = Some(target);
        p.resume = None;
        self.ready_remove(pid);

        if let Timeout::After(delay) = timeout {
            let deadline = self.now().saturating_add(delay);
            let key = self
                .timers
                .insert(deadline, TimerAction::ProcessTimeout(pid));
            self.process_mut(pid)?.timeout = Some(key);
            self.reprogram_hpet();
        }
        trace!("process {} waits on {:?}", pid.0, target);
        Ok(())
    }

    /// Complete a parked call. The caller has already unlinked `pid` from
    /// the object it waited on.
    pub fn wake_process(&mut self, pid: ProcessId, result: SvcResult) -> Result<(), KernelError> {
        let p = self.process_mut(pid)?;
        let runnable = match p.state {
            ProcessState::Waiting => ProcessState::Active,
            ProcessState::WaitingFrozen => ProcessState::Frozen,
            _ => return Err(KernelError::InvalidState),
        };
        p.state = runnable;
        p.waiting = None;
        p.last_error = result.error();
        p.resume = Some(result);
        let timeout = p.timeout.take();

        if let Some(key) = timeout {
            self.timers.remove(key);
            self.reprogram_hpet();
        }
        if runnable == ProcessState::Active {
            self.ready_insert(pid);
        }
        trace!("process {} woken", pid.0);
        Ok(())
    }

    /// Explicit wakeup of a plain sleep
    pub fn process_wakeup(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        match self.process(pid)?.waiting {
            Some(WaitTarget::Sleep) => self.wake_process(pid, SvcResult::Ok),
            _ => Err(KernelError::InvalidState),
        }
    }

    pub fn process_sleep(&mut self, pid: ProcessId, timeout: Timeout) -> Result<SvcResult, KernelError> {
        self.sleep_process(pid, WaitTarget::Sleep, timeout)?;
        Ok(SvcResult::Blocked)
    }

    /// Collect the result of a call that completed while parked
    pub fn take_resume(&mut self, pid: ProcessId) -> Option<SvcResult> {
        self.processes.get_mut(&pid).and_then(|p| p.resume.take())
    }

    /// Remove `pid` from the waiter list of `target`
    pub(crate) fn unlink_waiter(&mut self, pid: ProcessId, target: WaitTarget) {
        match target {
            WaitTarget::Sleep | WaitTarget::Ipc(_) => {}
            WaitTarget::Mutex(id) => {
                let owner = self.mutexes.get_mut(&id).and_then(|m| {
                    m.waiters.remove(pid);
                    m.owner
                });
                if let Some(owner) = owner {
                    self.update_priority_chain(owner);
                }
            }
            WaitTarget::Event(id) => {
                if let Some(e) = self.events.get_mut(&id) {
                    e.waiters.remove(pid);
                }
            }
            WaitTarget::Semaphore(id) => {
                if let Some(s) = self.semaphores.get_mut(&id) {
                    s.waiters.remove(pid);
                }
            }
            WaitTarget::Stream(id, dir) => {
                if let Some(s) = self.streams.get_mut(&id) {
                    match dir {
                        StreamDir::Read => s.readers.retain(|r| r.pid != pid),
                        StreamDir::Write => s.writers.retain(|w| w.pid != pid),
                    }
                }
            }
        }
    }
}

fn heap_error(pid: ProcessId, err: PoolError) -> KernelError {
    if let PoolError::Corrupted(addr) = err {
        warn!("process {} pool corrupted at {:#x}", pid.0, addr);
    }
    err.into()
}
