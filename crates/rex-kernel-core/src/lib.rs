//! Rex Kernel Core - HAL-free state machine for a single-core MCU kernel
//!
//! This crate contains every kernel policy decision: the priority ready
//! list, priority-inheriting mutexes, events and semaphores, per-process
//! IPC queues, stream pipes, the deadline list, pools and blocks. It never
//! touches hardware.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: time comes in as latched counter values,
//!    hardware requests go out as `Effect`s
//! 2. **One owned context**: all state lives in `Kernel`, passed explicitly
//! 3. **Typed handles**: objects are reached through handles drawn from one
//!    counter; a stale or foreign handle fails with `InvalidMagic`
//! 4. **Parked calls**: a blocking call returns `SvcResult::Blocked` and its
//!    real result lands in the caller's resume slot
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    rex-kernel-core                          │
//! │                 (Pure State Machine)                        │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │    Kernel     │    │  Kernel::svc  │                   │
//! │   │  - processes  │◀───│  typed Svc    │                   │
//! │   │  - ready list │    │  dispatch     │                   │
//! │   │  - sync/ipc   │    └───────────────┘                   │
//! │   │  - timers     │                                         │
//! │   │  - pools      │───▶ Vec<Effect>                         │
//! │   └───────────────┘                                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  Pool<M>      │    │  Invariants   │                   │
//! │   │  slot chains  │    │  Assertions   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      rex-kernel                             │
//! │                  (Runtime Wrapper)                          │
//! │                                                             │
//! │   - SVC word decoding and user pointer checks               │
//! │   - Interrupt entry points and context switch requests      │
//! │   - Panic policy and debug console                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - handles, priorities, time, IPC messages, effects
//! - `error` - `KernelError` and its numeric codes
//! - `config` - `KernelConfig`
//! - `pool` - first-fit slot allocator over a byte region
//! - `list` - ready list and FIFO wait queues
//! - `state` - the `Kernel` context
//! - `process` - lifecycle, scheduling, sleep/wake
//! - `sync` - mutex, event, semaphore
//! - `ipc` - per-process message queues
//! - `stream` - byte pipes
//! - `timer` - uptime, deadline list, soft timers
//! - `block` - ownership-transferable buffers
//! - `object` - system object registry
//! - `svc` - opcode table and dispatch
//! - `invariants` - runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod invariants;
pub mod ipc;
pub mod list;
pub mod object;
pub mod pool;
pub mod process;
pub mod state;
pub mod stream;
pub mod svc;
pub mod sync;
pub mod timer;
pub mod types;

pub use config::{KernelConfig, PanicPolicy};
pub use error::{KernelError, PanicReason, ERROR_OK, ERROR_SYNC};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use object::{ObjectRegistry, OBJECT_COUNT, SYS_OBJ_CORE, SYS_OBJ_STDIN, SYS_OBJ_STDOUT};
pub use pool::{Pool, PoolError, PoolStats, Region};
pub use process::{Process, MIN_PROCESS_SIZE};
pub use state::{Kernel, ROOT_NAME};
pub use svc::{opcode, Svc, SvcResult};
pub use timer::SOFT_TIMER_PERIODIC;
pub use types::{
    ipc_cmd, BlockId, Effect, EventId, Handle, IpcFilter, IpcMessage, KernelSnapshot, MutexId,
    Priority, ProcessId, ProcessInfo, ProcessState, RexDescriptor, SemId, SoftTimerId,
    StreamHandle, StreamId, SysTime, Timeout, WaitTarget, INVALID_HANDLE, IPC_ANY,
    REX_FLAG_ACTIVE,
};
