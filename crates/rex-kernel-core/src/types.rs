//! Core kernel types
//!
//! This module contains the fundamental types used throughout the kernel core.
//! All types here are pure data - no behavior that depends on HAL.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::pool::PoolStats;

/// Raw kernel object handle as seen through the SVC surface
pub type Handle = u32;

/// Never returned for a live object
pub const INVALID_HANDLE: Handle = 0;

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Sender recorded on messages posted from interrupt context
    pub const KERNEL: ProcessId = ProcessId(INVALID_HANDLE);
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);
    };
}

object_id!(
    /// Priority-inheriting mutex
    MutexId
);
object_id!(
    /// Broadcast event
    EventId
);
object_id!(
    /// Counting semaphore
    SemId
);
object_id!(
    /// Stream object (the shared pipe)
    StreamId
);
object_id!(
    /// Per-process handle onto a stream, obtained by `stream_open`
    StreamHandle
);
object_id!(
    /// Soft timer
    SoftTimerId
);
object_id!(
    /// Ownership-transferable buffer
    BlockId
);

/// Scheduling priority. Numerically lower is more important.
///
/// All comparisons in the scheduler and the inheritance logic go through
/// `is_more_important` / `min` so the direction is stated once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent priority
    pub const HIGHEST: Priority = Priority(0);
    /// Least urgent priority, held by the root process
    pub const IDLE: Priority = Priority(u8::MAX);

    pub fn is_more_important(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

/// Process state
///
/// Transitions: Active <-> Waiting, Active <-> Frozen, Waiting <-> WaitingFrozen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Runnable, linked into the ready list
    Active,
    /// Parked on a wait target
    Waiting,
    /// Suspended by flags, not runnable
    Frozen,
    /// Parked and suspended; resumes as Frozen when the wait completes
    WaitingFrozen,
}

impl ProcessState {
    pub fn is_waiting(self) -> bool {
        matches!(self, ProcessState::Waiting | ProcessState::WaitingFrozen)
    }
}

/// Process flag: runnable (clear means frozen)
pub const REX_FLAG_ACTIVE: u32 = 1 << 0;

/// Descriptor a process is created from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RexDescriptor {
    pub name: String,
    /// Bytes of process memory (private pool plus stack)
    pub size: usize,
    pub priority: Priority,
    pub flags: u32,
    /// IPC ring capacity in messages
    pub ipc_size: usize,
}

impl RexDescriptor {
    pub fn new(name: &str, size: usize, priority: Priority) -> Self {
        Self {
            name: String::from(name),
            size,
            priority,
            flags: REX_FLAG_ACTIVE,
            ipc_size: 4,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ipc_size(mut self, ipc_size: usize) -> Self {
        self.ipc_size = ipc_size;
        self
    }
}

/// Monotonic time since boot
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SysTime {
    pub sec: u32,
    pub usec: u32,
}

impl SysTime {
    pub const ZERO: SysTime = SysTime { sec: 0, usec: 0 };

    pub const fn new(sec: u32, usec: u32) -> Self {
        Self {
            sec: sec.saturating_add(usec / 1_000_000),
            usec: usec % 1_000_000,
        }
    }

    pub const fn from_ms(ms: u32) -> Self {
        Self::new(ms / 1000, (ms % 1000) * 1000)
    }

    pub const fn from_us(us: u32) -> Self {
        Self::new(0, us)
    }

    pub fn saturating_add(self, other: SysTime) -> SysTime {
        let usec = self.usec + other.usec;
        SysTime {
            sec: self
                .sec
                .saturating_add(other.sec)
                .saturating_add(usec / 1_000_000),
            usec: usec % 1_000_000,
        }
    }

    pub fn is_zero(self) -> bool {
        self == SysTime::ZERO
    }
}

/// How long a blocking call may park
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(SysTime),
}

impl Timeout {
    pub fn ms(ms: u32) -> Self {
        Timeout::After(SysTime::from_ms(ms))
    }

    /// SVC encoding: zero means wait forever
    pub fn from_ms_word(ms: u32) -> Self {
        if ms == 0 {
            Timeout::Infinite
        } else {
            Timeout::ms(ms)
        }
    }
}

/// IPC message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub sender: ProcessId,
    pub cmd: u32,
    pub param1: u32,
    pub param2: u32,
    pub param3: u32,
}

impl IpcMessage {
    pub fn new(cmd: u32, param1: u32, param2: u32, param3: u32) -> Self {
        Self {
            sender: ProcessId::KERNEL,
            cmd,
            param1,
            param2,
            param3,
        }
    }
}

/// Well-known IPC commands
pub mod ipc_cmd {
    /// Liveness probe, answered by the receiver with the same cmd
    pub const IPC_PING: u32 = 0x0000_0000;
    /// Soft timer expiry: param1 = timer handle, param2 = timer param
    pub const IPC_TIMEOUT: u32 = 0x0000_0001;
    /// Stream has data: param1 = stream handle, param2 = listener param
    pub const IPC_STREAM_WRITE: u32 = 0x0000_0002;
    /// First command free for user protocols
    pub const IPC_USER: u32 = 0x0000_8000;
}

/// Filter word meaning "any value" in the SVC encoding
pub const IPC_ANY: u32 = u32::MAX;

/// Receive filter. `None` fields match anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcFilter {
    pub sender: Option<ProcessId>,
    pub cmd: Option<u32>,
    pub param1: Option<u32>,
}

impl IpcFilter {
    pub const ANY: IpcFilter = IpcFilter {
        sender: None,
        cmd: None,
        param1: None,
    };

    /// Build from SVC words, where `IPC_ANY` is the wildcard
    pub fn from_words(sender: u32, cmd: u32, param1: u32) -> Self {
        let field = |w: u32| if w == IPC_ANY { None } else { Some(w) };
        Self {
            sender: field(sender).map(ProcessId),
            cmd: field(cmd),
            param1: field(param1),
        }
    }

    pub fn matches(&self, msg: &IpcMessage) -> bool {
        self.sender.map_or(true, |s| s == msg.sender)
            && self.cmd.map_or(true, |c| c == msg.cmd)
            && self.param1.map_or(true, |p| p == msg.param1)
    }
}

/// Stream wait direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDir {
    Read,
    Write,
}

/// What a parked process is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitTarget {
    /// Plain timed sleep
    Sleep,
    Mutex(MutexId),
    Event(EventId),
    Semaphore(SemId),
    Stream(StreamId, StreamDir),
    Ipc(IpcFilter),
}

/// Side effect requested by the core, applied to the HAL by the runtime wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// The ready-list head changed; a context switch is due
    PendSwitch,
    /// Arm the one-shot hardware timer
    HpetStart(u32),
    /// Disarm the one-shot hardware timer
    HpetStop,
    /// Text for the debug console
    Debug(String),
}

/// Read-only view of one process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub base_priority: Priority,
    pub current_priority: Priority,
    pub ipc_pending: usize,
    pub ipc_capacity: usize,
    pub heap: PoolStats,
}

/// Serializable snapshot of scheduler and memory state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub uptime: SysTime,
    pub running: Option<ProcessId>,
    pub ready: Vec<ProcessId>,
    pub processes: Vec<ProcessInfo>,
    pub pools: Vec<PoolStats>,
    pub timers_armed: usize,
}
