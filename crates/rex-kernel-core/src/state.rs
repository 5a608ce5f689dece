//! Kernel state - the single owned context every operation runs against
//!
//! `Kernel` holds all mutable kernel state. It has NO HAL dependency: time
//! enters as a latched hardware counter and side effects leave as `Effect`s
//! that the runtime wrapper (`rex-kernel`) applies.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::debug;

use crate::block::Block;
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::object::ObjectRegistry;
use crate::pool::{Pool, Region};
use crate::process::Process;
use crate::stream::{Stream, StreamBinding};
use crate::sync::{Event, Mutex, Semaphore};
use crate::timer::{SoftTimer, TimerList};
use crate::list::ReadyList;
use crate::types::{
    BlockId, Effect, EventId, KernelSnapshot, MutexId, Priority, ProcessId, RexDescriptor, SemId,
    SoftTimerId, StreamHandle, StreamId, SysTime, INVALID_HANDLE, REX_FLAG_ACTIVE,
};

/// Name of the process created by `Kernel::new`
pub const ROOT_NAME: &str = "init";

/// The kernel context.
///
/// Every table is keyed by handles drawn from one counter, so a handle of
/// one kind never resolves in another kind's table.
pub struct Kernel {
    pub config: KernelConfig,
    /// Process table
    pub processes: BTreeMap<ProcessId, Process>,
    pub ready: ReadyList,
    /// System pools, searched in registration order
    pub pools: Vec<Pool<Region>>,
    pub mutexes: BTreeMap<MutexId, Mutex>,
    pub events: BTreeMap<EventId, Event>,
    pub semaphores: BTreeMap<SemId, Semaphore>,
    pub streams: BTreeMap<StreamId, Stream>,
    pub stream_handles: BTreeMap<StreamHandle, StreamBinding>,
    pub soft_timers: BTreeMap<SoftTimerId, SoftTimer>,
    pub blocks: BTreeMap<BlockId, Block>,
    pub timers: TimerList,
    pub objects: ObjectRegistry,
    /// Whether `DebugWrite` reaches the console
    pub debug_enabled: bool,
    /// Total IPC messages posted since boot
    pub total_ipc_count: u64,
    pub(crate) running: Option<ProcessId>,
    pub(crate) uptime_sec: u32,
    pub(crate) elapsed_us: u32,
    /// Deadline the hardware timer is currently armed for
    pub(crate) hpet: Option<SysTime>,
    root: ProcessId,
    next_handle: u32,
    effects: Vec<Effect>,
}

impl Kernel {
    /// Boot the kernel over the first system pool and create the root process.
    pub fn new(config: KernelConfig, pool_base: usize, region: Region) -> Result<Self, KernelError> {
        let pool = Pool::new(pool_base, region, config.pool_guards)?;
        let objects = ObjectRegistry::new(config.object_count);
        let root_rex = RexDescriptor {
            name: ROOT_NAME.into(),
            size: config.root_size,
            priority: Priority::IDLE,
            flags: REX_FLAG_ACTIVE,
            ipc_size: config.root_ipc_size,
        };

        let mut kernel = Self {
            config,
            processes: BTreeMap::new(),
            ready: ReadyList::new(),
            pools: alloc::vec![pool],
            mutexes: BTreeMap::new(),
            events: BTreeMap::new(),
            semaphores: BTreeMap::new(),
            streams: BTreeMap::new(),
            stream_handles: BTreeMap::new(),
            soft_timers: BTreeMap::new(),
            blocks: BTreeMap::new(),
            timers: TimerList::new(),
            objects,
            debug_enabled: true,
            total_ipc_count: 0,
            running: None,
            uptime_sec: 0,
            elapsed_us: 0,
            hpet: None,
            root: ProcessId(INVALID_HANDLE),
            next_handle: 1,
            effects: Vec::new(),
        };
        kernel.root = kernel.process_create(&root_rex)?;
        debug!("kernel up, root process {}", kernel.root.0);
        Ok(kernel)
    }

    pub fn root(&self) -> ProcessId {
        self.root
    }

    /// Process currently holding the CPU
    pub fn current(&self) -> Option<ProcessId> {
        self.running
    }

    /// Draw the next handle. Zero is skipped.
    pub(crate) fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    // ========================================================================
    // Effects
    // ========================================================================

    pub(crate) fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn pend_switch(&mut self) {
        if self.effects.last() != Some(&Effect::PendSwitch) {
            self.effects.push(Effect::PendSwitch);
        }
    }

    /// Drain effects in the order they were requested
    pub fn take_effects(&mut self) -> Vec<Effect> {
        core::mem::take(&mut self.effects)
    }

    pub fn pending_effects(&self) -> &[Effect] {
        &self.effects
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn process(&self, pid: ProcessId) -> Result<&Process, KernelError> {
        self.processes.get(&pid).ok_or(KernelError::InvalidMagic)
    }

    pub(crate) fn process_mut(&mut self, pid: ProcessId) -> Result<&mut Process, KernelError> {
        self.processes.get_mut(&pid).ok_or(KernelError::InvalidMagic)
    }

    // ========================================================================
    // System pools
    // ========================================================================

    /// Whether `[base, base + len)` may become a new system pool
    pub fn check_pool_range(&self, base: usize, len: usize) -> Result<(), KernelError> {
        let end = base.checked_add(len).ok_or(KernelError::InvalidParams)?;
        if len == 0 {
            return Err(KernelError::InvalidParams);
        }
        if self
            .pools
            .iter()
            .any(|p| base < p.end() && p.base() < end)
        {
            return Err(KernelError::AlreadyConfigured);
        }
        Ok(())
    }

    /// Register another RAM region as a system pool.
    pub fn add_pool(&mut self, base: usize, region: Region) -> Result<usize, KernelError> {
        let len = region.as_ref().len();
        self.check_pool_range(base, len)?;
        let pool = Pool::new(base, region, self.config.pool_guards)
            .map_err(|_| KernelError::InvalidParams)?;
        self.pools.push(pool);
        debug!("system pool {} at {:#x} ({} bytes)", self.pools.len() - 1, base, len);
        Ok(self.pools.len() - 1)
    }

    /// Allocate from the first system pool that fits
    pub(crate) fn alloc_system(&mut self, size: usize) -> Result<(usize, usize), KernelError> {
        for (index, pool) in self.pools.iter_mut().enumerate() {
            let end = pool.end();
            match pool.allocate(size, end) {
                Ok(addr) => return Ok((index, addr)),
                Err(crate::pool::PoolError::OutOfMemory) => continue,
                Err(e) => {
                    log::warn!("system pool {} rejected allocation: {}", index, e);
                    return Err(e.into());
                }
            }
        }
        Err(KernelError::OutOfSystemMemory)
    }

    pub(crate) fn free_system(&mut self, pool_index: usize, addr: usize) -> Result<(), KernelError> {
        let pool = self
            .pools
            .get_mut(pool_index)
            .ok_or(KernelError::InvalidParams)?;
        pool.free(addr).map_err(|e| {
            log::warn!("system pool {} free of {:#x} failed: {}", pool_index, addr, e);
            KernelError::from(e)
        })
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            uptime: self.now(),
            running: self.running,
            ready: self.ready.pids(),
            processes: self.processes.values().map(Process::info).collect(),
            pools: self.pools.iter().map(Pool::stats).collect(),
            timers_armed: self.timers.len(),
        }
    }
}
