//! Supervisor-call dispatch
//!
//! `Kernel::svc(caller, Svc)` is the single typed entry point for process
//! requests. Raw trap words are decoded into `Svc` by the runtime wrapper;
//! the opcode table lives here so both sides agree on it.
//!
//! Every call writes the caller's last-error cell, except calls that park:
//! their cell is written when the wait completes.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::KernelError;
use crate::state::Kernel;
use crate::types::{
    BlockId, EventId, Handle, IpcFilter, IpcMessage, MutexId, Priority, ProcessId, ProcessState,
    RexDescriptor, SemId, SoftTimerId, StreamHandle, StreamId, SysTime, Timeout,
};

// ============================================================================
// Opcodes
// ============================================================================

/// SVC opcode table, grouped by subsystem in the high byte
pub mod opcode {
    pub const PROCESS_CREATE: u32 = 0x0001;
    pub const PROCESS_DESTROY: u32 = 0x0002;
    pub const PROCESS_GET_PRIORITY: u32 = 0x0003;
    pub const PROCESS_SET_PRIORITY: u32 = 0x0004;
    pub const PROCESS_GET_FLAGS: u32 = 0x0005;
    pub const PROCESS_SET_FLAGS: u32 = 0x0006;
    pub const PROCESS_SLEEP: u32 = 0x0007;
    pub const PROCESS_WAKEUP: u32 = 0x0008;
    pub const PROCESS_GET_CURRENT: u32 = 0x0009;
    pub const PROCESS_GET_LAST_ERROR: u32 = 0x000A;
    pub const PROCESS_GET_NAME: u32 = 0x000B;

    pub const MUTEX_CREATE: u32 = 0x0101;
    pub const MUTEX_LOCK: u32 = 0x0102;
    pub const MUTEX_UNLOCK: u32 = 0x0103;
    pub const MUTEX_DESTROY: u32 = 0x0104;

    pub const EVENT_CREATE: u32 = 0x0201;
    pub const EVENT_WAIT: u32 = 0x0202;
    pub const EVENT_SET: u32 = 0x0203;
    pub const EVENT_PULSE: u32 = 0x0204;
    pub const EVENT_CLEAR: u32 = 0x0205;
    pub const EVENT_IS_SET: u32 = 0x0206;
    pub const EVENT_DESTROY: u32 = 0x0207;

    pub const SEM_CREATE: u32 = 0x0301;
    pub const SEM_WAIT: u32 = 0x0302;
    pub const SEM_SIGNAL: u32 = 0x0303;
    pub const SEM_GET_VALUE: u32 = 0x0304;
    pub const SEM_DESTROY: u32 = 0x0305;

    pub const IPC_POST: u32 = 0x0401;
    pub const IPC_WAIT: u32 = 0x0402;
    pub const IPC_CALL: u32 = 0x0403;
    pub const IPC_READ: u32 = 0x0404;

    pub const STREAM_CREATE: u32 = 0x0501;
    pub const STREAM_OPEN: u32 = 0x0502;
    pub const STREAM_CLOSE: u32 = 0x0503;
    pub const STREAM_READ: u32 = 0x0504;
    pub const STREAM_WRITE: u32 = 0x0505;
    pub const STREAM_LISTEN: u32 = 0x0506;
    pub const STREAM_STOP_LISTEN: u32 = 0x0507;
    pub const STREAM_FLUSH: u32 = 0x0508;
    pub const STREAM_GET_SIZE: u32 = 0x0509;
    pub const STREAM_GET_FREE: u32 = 0x050A;
    pub const STREAM_DESTROY: u32 = 0x050B;

    pub const TIMER_GET_UPTIME: u32 = 0x0601;
    pub const SOFT_TIMER_CREATE: u32 = 0x0602;
    pub const SOFT_TIMER_START: u32 = 0x0603;
    pub const SOFT_TIMER_STOP: u32 = 0x0604;
    pub const SOFT_TIMER_DESTROY: u32 = 0x0605;

    pub const OBJECT_GET: u32 = 0x0701;
    pub const OBJECT_SET: u32 = 0x0702;

    /// Handled by the runtime: needs the HAL to map the region
    pub const POOL_REGISTER: u32 = 0x0801;
    pub const POOL_MALLOC: u32 = 0x0802;
    pub const POOL_FREE: u32 = 0x0803;
    pub const POOL_REALLOC: u32 = 0x0804;

    pub const BLOCK_CREATE: u32 = 0x0901;
    pub const BLOCK_OPEN: u32 = 0x0902;
    pub const BLOCK_CLOSE: u32 = 0x0903;
    pub const BLOCK_SEND: u32 = 0x0904;
    pub const BLOCK_SEND_TO_OWNER: u32 = 0x0905;
    pub const BLOCK_DESTROY: u32 = 0x0906;
    pub const BLOCK_GET_SIZE: u32 = 0x0907;
    pub const BLOCK_GET_DATA_SIZE: u32 = 0x0908;
    pub const BLOCK_SET_DATA_SIZE: u32 = 0x0909;

    pub const DEBUG_WRITE: u32 = 0x0A01;
    pub const DEBUG_SETUP: u32 = 0x0A02;
}

// ============================================================================
// Requests
// ============================================================================

/// Typed supervisor calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Svc {
    ProcessCreate { rex: RexDescriptor },
    ProcessDestroy { pid: ProcessId },
    ProcessGetPriority { pid: ProcessId },
    ProcessSetPriority { pid: ProcessId, priority: Priority },
    ProcessGetFlags { pid: ProcessId },
    ProcessSetFlags { pid: ProcessId, flags: u32 },
    ProcessSleep { timeout: Timeout },
    ProcessWakeup { pid: ProcessId },
    ProcessGetCurrent,
    /// Does not overwrite the cell it reads
    ProcessGetLastError,
    ProcessGetName { pid: ProcessId },

    MutexCreate,
    MutexLock { mutex: MutexId, timeout: Timeout },
    MutexUnlock { mutex: MutexId },
    MutexDestroy { mutex: MutexId },

    EventCreate,
    EventWait { event: EventId, timeout: Timeout },
    EventSet { event: EventId },
    EventPulse { event: EventId },
    EventClear { event: EventId },
    EventIsSet { event: EventId },
    EventDestroy { event: EventId },

    SemCreate { value: u32 },
    SemWait { sem: SemId, timeout: Timeout },
    SemSignal { sem: SemId },
    SemGetValue { sem: SemId },
    SemDestroy { sem: SemId },

    IpcPost { dest: ProcessId, msg: IpcMessage },
    IpcWait { filter: IpcFilter, timeout: Timeout },
    IpcCall { dest: ProcessId, msg: IpcMessage, timeout: Timeout },
    IpcRead { filter: IpcFilter },

    StreamCreate { size: usize },
    StreamOpen { stream: StreamId },
    StreamClose { handle: StreamHandle },
    StreamRead { handle: StreamHandle, size: usize },
    StreamWrite { handle: StreamHandle, data: Vec<u8> },
    StreamListen { handle: StreamHandle, param: u32 },
    StreamStopListen { handle: StreamHandle },
    StreamFlush { handle: StreamHandle },
    StreamGetSize { handle: StreamHandle },
    StreamGetFree { handle: StreamHandle },
    StreamDestroy { stream: StreamId },

    TimerGetUptime,
    SoftTimerCreate { param: u32, flags: u32 },
    SoftTimerStart { timer: SoftTimerId, timeout: SysTime },
    SoftTimerStop { timer: SoftTimerId },
    SoftTimerDestroy { timer: SoftTimerId },

    ObjectGet { index: usize },
    ObjectSet { index: usize, handle: Handle },

    Malloc { size: usize },
    Free { addr: usize },
    Realloc { addr: usize, size: usize },

    BlockCreate { size: usize },
    BlockOpen { block: BlockId },
    BlockClose { block: BlockId },
    BlockSend { block: BlockId, to: ProcessId },
    BlockSendToOwner { block: BlockId },
    BlockDestroy { block: BlockId },
    BlockGetSize { block: BlockId },
    BlockGetDataSize { block: BlockId },
    BlockSetDataSize { block: BlockId, size: usize },

    DebugWrite { text: String },
    DebugSetup { enabled: bool },
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a supervisor call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SvcResult {
    /// Success, nothing to return
    Ok,
    Value(u32),
    Handle(Handle),
    Address(usize),
    Time(SysTime),
    Message(IpcMessage),
    Bytes(Vec<u8>),
    /// The caller is parked; the result arrives through its resume slot
    Blocked,
    Err(KernelError),
}

impl SvcResult {
    pub fn error(&self) -> Option<KernelError> {
        match self {
            SvcResult::Err(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, SvcResult::Blocked)
    }
}

impl From<Result<(), KernelError>> for SvcResult {
    fn from(r: Result<(), KernelError>) -> Self {
        match r {
            Ok(()) => SvcResult::Ok,
            Err(e) => SvcResult::Err(e),
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl Kernel {
    /// Execute one supervisor call on behalf of `caller`.
    pub fn svc(&mut self, caller: ProcessId, svc: Svc) -> SvcResult {
        if matches!(svc, Svc::ProcessGetLastError) {
            return match self.process(caller) {
                Ok(p) => SvcResult::Value(p.last_error.map_or(crate::error::ERROR_OK, |e| e.code())),
                Err(e) => SvcResult::Err(e),
            };
        }

        let result = self
            .dispatch(caller, svc)
            .unwrap_or_else(SvcResult::Err);
        if !result.is_blocked() {
            if let Some(p) = self.processes.get_mut(&caller) {
                p.last_error = result.error();
            }
        }
        result
    }

    fn dispatch(&mut self, caller: ProcessId, svc: Svc) -> Result<SvcResult, KernelError> {
        if self.process(caller)?.state != ProcessState::Active {
            return Err(KernelError::NotActive);
        }

        let done = |r: Result<(), KernelError>| r.map(|()| SvcResult::Ok);
        let value = |v: usize| SvcResult::Value(v as u32);

        match svc {
            // Process
            Svc::ProcessCreate { rex } => Ok(SvcResult::Handle(self.process_create(&rex)?.0)),
            Svc::ProcessDestroy { pid } => done(self.process_destroy(pid)),
            Svc::ProcessGetPriority { pid } => {
                Ok(SvcResult::Value(self.process_get_priority(pid)?.0 as u32))
            }
            Svc::ProcessSetPriority { pid, priority } => {
                done(self.process_set_priority(pid, priority))
            }
            Svc::ProcessGetFlags { pid } => Ok(SvcResult::Value(self.process_get_flags(pid)?)),
            Svc::ProcessSetFlags { pid, flags } => done(self.process_set_flags(pid, flags)),
            Svc::ProcessSleep { timeout } => self.process_sleep(caller, timeout),
            Svc::ProcessWakeup { pid } => done(self.process_wakeup(pid)),
            Svc::ProcessGetCurrent => Ok(SvcResult::Handle(caller.0)),
            Svc::ProcessGetLastError => Err(KernelError::InvalidState),
            Svc::ProcessGetName { pid } => Ok(SvcResult::Bytes(
                self.process_get_name(pid)?.as_bytes().to_vec(),
            )),

            // Mutex
            Svc::MutexCreate => Ok(SvcResult::Handle(self.mutex_create().0)),
            Svc::MutexLock { mutex, timeout } => self.mutex_lock(caller, mutex, timeout),
            Svc::MutexUnlock { mutex } => done(self.mutex_unlock(caller, mutex)),
            Svc::MutexDestroy { mutex } => done(self.mutex_destroy(mutex)),

            // Event
            Svc::EventCreate => Ok(SvcResult::Handle(self.event_create().0)),
            Svc::EventWait { event, timeout } => self.event_wait(caller, event, timeout),
            Svc::EventSet { event } => done(self.event_set(event)),
            Svc::EventPulse { event } => done(self.event_pulse(event)),
            Svc::EventClear { event } => done(self.event_clear(event)),
            Svc::EventIsSet { event } => Ok(SvcResult::Value(self.event_is_set(event)? as u32)),
            Svc::EventDestroy { event } => done(self.event_destroy(event)),

            // Semaphore
            Svc::SemCreate { value } => Ok(SvcResult::Handle(self.sem_create(value).0)),
            Svc::SemWait { sem, timeout } => self.sem_wait(caller, sem, timeout),
            Svc::SemSignal { sem } => done(self.sem_signal(sem)),
            Svc::SemGetValue { sem } => Ok(SvcResult::Value(self.sem_get_value(sem)?)),
            Svc::SemDestroy { sem } => done(self.sem_destroy(sem)),

            // IPC
            Svc::IpcPost { dest, msg } => done(self.ipc_post(caller, dest, msg)),
            Svc::IpcWait { filter, timeout } => self.ipc_wait(caller, filter, timeout),
            Svc::IpcCall { dest, msg, timeout } => self.ipc_call(caller, dest, msg, timeout),
            Svc::IpcRead { filter } => Ok(SvcResult::Message(self.ipc_read(caller, filter)?)),

            // Stream
            Svc::StreamCreate { size } => Ok(SvcResult::Handle(self.stream_create(size)?.0)),
            Svc::StreamOpen { stream } => {
                Ok(SvcResult::Handle(self.stream_open(caller, stream)?.0))
            }
            Svc::StreamClose { handle } => done(self.stream_close(caller, handle)),
            Svc::StreamRead { handle, size } => self.stream_read(caller, handle, size),
            Svc::StreamWrite { handle, data } => self.stream_write(caller, handle, &data),
            Svc::StreamListen { handle, param } => done(self.stream_listen(caller, handle, param)),
            Svc::StreamStopListen { handle } => done(self.stream_stop_listen(caller, handle)),
            Svc::StreamFlush { handle } => done(self.stream_flush(caller, handle)),
            Svc::StreamGetSize { handle } => Ok(value(self.stream_get_size(caller, handle)?)),
            Svc::StreamGetFree { handle } => Ok(value(self.stream_get_free(caller, handle)?)),
            Svc::StreamDestroy { stream } => done(self.stream_destroy(stream)),

            // Timer
            Svc::TimerGetUptime => Ok(SvcResult::Time(self.now())),
            Svc::SoftTimerCreate { param, flags } => Ok(SvcResult::Handle(
                self.soft_timer_create(caller, param, flags)?.0,
            )),
            Svc::SoftTimerStart { timer, timeout } => {
                done(self.soft_timer_start(caller, timer, timeout))
            }
            Svc::SoftTimerStop { timer } => done(self.soft_timer_stop(caller, timer)),
            Svc::SoftTimerDestroy { timer } => done(self.soft_timer_destroy(caller, timer)),

            // Object registry
            Svc::ObjectGet { index } => Ok(SvcResult::Handle(self.object_get(index)?)),
            Svc::ObjectSet { index, handle } => done(self.object_set(index, handle)),

            // Private pool
            Svc::Malloc { size } => Ok(SvcResult::Address(self.process_malloc(caller, size)?)),
            Svc::Free { addr } => done(self.process_free(caller, addr)),
            Svc::Realloc { addr, size } => Ok(SvcResult::Address(
                self.process_realloc(caller, addr, size)?,
            )),

            // Block
            Svc::BlockCreate { size } => Ok(SvcResult::Handle(self.block_create(caller, size)?.0)),
            Svc::BlockOpen { block } => Ok(SvcResult::Address(self.block_open(caller, block)?)),
            Svc::BlockClose { block } => done(self.block_close(caller, block)),
            Svc::BlockSend { block, to } => done(self.block_send(caller, block, to)),
            Svc::BlockSendToOwner { block } => done(self.block_send_to_owner(caller, block)),
            Svc::BlockDestroy { block } => done(self.block_destroy(caller, block)),
            Svc::BlockGetSize { block } => Ok(value(self.block_get_size(block)?)),
            Svc::BlockGetDataSize { block } => Ok(value(self.block_get_data_size(block)?)),
            Svc::BlockSetDataSize { block, size } => {
                done(self.block_set_data_size(caller, block, size))
            }

            // Debug
            Svc::DebugWrite { text } => {
                if self.debug_enabled {
                    let name = self.process_get_name(caller)?;
                    let line = format!("[{}] {}", name, text);
                    self.emit(crate::types::Effect::Debug(line));
                }
                Ok(SvcResult::Ok)
            }
            Svc::DebugSetup { enabled } => {
                self.debug_enabled = enabled;
                Ok(SvcResult::Ok)
            }
        }
    }
}
