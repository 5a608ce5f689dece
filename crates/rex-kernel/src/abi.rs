//! Raw SVC word decoding
//!
//! A trap carries an opcode and three parameter words. Scalars travel in the
//! words directly; structures and results travel through pointers into the
//! caller's memory, all little-endian `u32` words. Every pointer is checked
//! against the caller's region (or a block it holds mapped) before the HAL
//! touches it.
//!
//! # Layouts
//!
//! | Record | Words |
//! |---|---|
//! | descriptor | `name_ptr, name_len, size, priority, flags, ipc_size` |
//! | message | `sender, cmd, param1, param2, param3` (sender ignored on input) |
//! | filter | `sender, cmd, param1`, `IPC_ANY` matches anything |
//! | io | `buf, len`; `len` is rewritten with the bytes transferred |
//! | time | `sec, usec` |
//!
//! Timeouts are milliseconds, zero meaning forever.

use alloc::string::String;
use alloc::vec::Vec;

use rex_hal::{HalError, HAL};
use rex_kernel_core::svc::opcode::*;
use rex_kernel_core::{
    BlockId, EventId, IpcFilter, IpcMessage, Kernel, KernelError, MutexId, Priority, ProcessId,
    RexDescriptor, SemId, SoftTimerId, StreamHandle, StreamId, Svc, SvcResult, SysTime, Timeout,
};

const WORD: usize = 4;

pub const DESCRIPTOR_SIZE: usize = 6 * WORD;
pub const MESSAGE_SIZE: usize = 5 * WORD;
pub const FILTER_SIZE: usize = 3 * WORD;
pub const IO_SIZE: usize = 2 * WORD;
pub const TIME_SIZE: usize = 2 * WORD;

/// Longest process name accepted by `PROCESS_CREATE`
pub const MAX_NAME_LEN: usize = 32;
/// Debug writes are truncated to this many bytes
pub const MAX_DEBUG_LEN: usize = 256;

/// Where the result of a call goes in the caller's memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Out {
    None,
    Word(usize),
    Time(usize),
    Message(usize),
    /// Data buffer plus the length word to rewrite
    Io { buf: usize, cap: usize, len_at: usize },
}

/// A decoded trap
#[derive(Debug)]
pub struct Decoded {
    pub svc: Svc,
    pub out: Out,
}

fn hal_error(_: HalError) -> KernelError {
    KernelError::AccessDenied
}

/// Caller memory, checked on every access
pub struct UserMemory<'a, H: HAL> {
    hal: &'a H,
    kernel: &'a Kernel,
    pid: ProcessId,
}

impl<'a, H: HAL> UserMemory<'a, H> {
    pub fn new(hal: &'a H, kernel: &'a Kernel, pid: ProcessId) -> Self {
        Self { hal, kernel, pid }
    }

    pub fn check(&self, addr: usize, len: usize) -> Result<(), KernelError> {
        self.kernel.check_address(self.pid, addr, len)
    }

    pub fn read(&self, addr: usize, len: usize) -> Result<Vec<u8>, KernelError> {
        self.check(addr, len)?;
        let mut buf = alloc::vec![0u8; len];
        self.hal.copy_from_user(addr, &mut buf).map_err(hal_error)?;
        Ok(buf)
    }

    pub fn read_words<const N: usize>(&self, addr: usize) -> Result<[u32; N], KernelError> {
        let bytes = self.read(addr, N * WORD)?;
        let mut words = [0u32; N];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD)) {
            let mut b = [0u8; WORD];
            b.copy_from_slice(chunk);
            *w = u32::from_le_bytes(b);
        }
        Ok(words)
    }

    pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), KernelError> {
        self.check(addr, data.len())?;
        self.hal.copy_to_user(addr, data).map_err(hal_error)
    }

    pub fn write_words(&self, addr: usize, words: &[u32]) -> Result<(), KernelError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(addr, &bytes)
    }

    /// Store a call result at its out-location
    pub fn deliver(&self, out: Out, result: &SvcResult) -> Result<(), KernelError> {
        match (out, result) {
            (Out::Word(at), SvcResult::Value(v) | SvcResult::Handle(v)) => {
                self.write_words(at, &[*v])
            }
            (Out::Word(at), SvcResult::Address(a)) => self.write_words(at, &[*a as u32]),
            (Out::Time(at), SvcResult::Time(t)) => self.write_words(at, &[t.sec, t.usec]),
            (Out::Message(at), SvcResult::Message(m)) => self.write_words(
                at,
                &[m.sender.0, m.cmd, m.param1, m.param2, m.param3],
            ),
            (Out::Io { buf, cap, len_at }, SvcResult::Bytes(data)) => {
                let n = data.len().min(cap);
                self.write(buf, &data[..n])?;
                self.write_words(len_at, &[n as u32])
            }
            (Out::Io { len_at, .. }, SvcResult::Value(n)) => self.write_words(len_at, &[*n]),
            _ => Ok(()),
        }
    }

    fn out_word(&self, addr: u32) -> Result<Out, KernelError> {
        let at = addr as usize;
        self.check(at, WORD)?;
        Ok(Out::Word(at))
    }

    fn io(&self, addr: u32) -> Result<(usize, usize, usize), KernelError> {
        let len_at = (addr as usize).saturating_add(WORD);
        let [buf, len] = self.read_words::<2>(addr as usize)?;
        self.check(len_at, WORD)?;
        Ok((buf as usize, len as usize, len_at))
    }
}

fn timeout(ms: u32) -> Timeout {
    Timeout::from_ms_word(ms)
}

fn message(words: [u32; 5]) -> IpcMessage {
    IpcMessage::new(words[1], words[2], words[3], words[4])
}

/// Turn a raw trap into a typed call plus its out-location.
///
/// `POOL_REGISTER` is not decoded here; it needs the HAL and is handled by
/// `System` itself.
pub fn decode<H: HAL>(
    mem: &UserMemory<'_, H>,
    opcode: u32,
    p1: u32,
    p2: u32,
    p3: u32,
) -> Result<Decoded, KernelError> {
    let plain = |svc: Svc| -> Result<Decoded, KernelError> { Ok(Decoded { svc, out: Out::None }) };
    let with = |svc: Svc, out: Out| -> Result<Decoded, KernelError> { Ok(Decoded { svc, out }) };
    let pid = ProcessId(p1);

    match opcode {
        // Process
        PROCESS_CREATE => {
            let [name_ptr, name_len, size, priority, flags, ipc_size] =
                mem.read_words::<6>(p1 as usize)?;
            let name_len = name_len as usize;
            if name_len == 0 || name_len > MAX_NAME_LEN || priority > u8::MAX as u32 {
                return Err(KernelError::InvalidParams);
            }
            let name = String::from_utf8(mem.read(name_ptr as usize, name_len)?)
                .map_err(|_| KernelError::InvalidParams)?;
            let rex = RexDescriptor::new(&name, size as usize, Priority(priority as u8))
                .with_flags(flags)
                .with_ipc_size(ipc_size as usize);
            with(Svc::ProcessCreate { rex }, mem.out_word(p2)?)
        }
        PROCESS_DESTROY => plain(Svc::ProcessDestroy { pid }),
        PROCESS_GET_PRIORITY => with(Svc::ProcessGetPriority { pid }, mem.out_word(p2)?),
        PROCESS_SET_PRIORITY => {
            let priority = u8::try_from(p2).map_err(|_| KernelError::InvalidParams)?;
            plain(Svc::ProcessSetPriority {
                pid,
                priority: Priority(priority),
            })
        }
        PROCESS_GET_FLAGS => with(Svc::ProcessGetFlags { pid }, mem.out_word(p2)?),
        PROCESS_SET_FLAGS => plain(Svc::ProcessSetFlags { pid, flags: p2 }),
        PROCESS_SLEEP => plain(Svc::ProcessSleep { timeout: timeout(p1) }),
        PROCESS_WAKEUP => plain(Svc::ProcessWakeup { pid }),
        PROCESS_GET_CURRENT => with(Svc::ProcessGetCurrent, mem.out_word(p1)?),
        PROCESS_GET_LAST_ERROR => with(Svc::ProcessGetLastError, mem.out_word(p1)?),
        PROCESS_GET_NAME => {
            let (buf, cap, len_at) = mem.io(p2)?;
            mem.check(buf, cap)?;
            with(Svc::ProcessGetName { pid }, Out::Io { buf, cap, len_at })
        }

        // Mutex
        MUTEX_CREATE => with(Svc::MutexCreate, mem.out_word(p1)?),
        MUTEX_LOCK => plain(Svc::MutexLock {
            mutex: MutexId(p1),
            timeout: timeout(p2),
        }),
        MUTEX_UNLOCK => plain(Svc::MutexUnlock { mutex: MutexId(p1) }),
        MUTEX_DESTROY => plain(Svc::MutexDestroy { mutex: MutexId(p1) }),

        // Event
        EVENT_CREATE => with(Svc::EventCreate, mem.out_word(p1)?),
        EVENT_WAIT => plain(Svc::EventWait {
            event: EventId(p1),
            timeout: timeout(p2),
        }),
        EVENT_SET => plain(Svc::EventSet { event: EventId(p1) }),
        EVENT_PULSE => plain(Svc::EventPulse { event: EventId(p1) }),
        EVENT_CLEAR => plain(Svc::EventClear { event: EventId(p1) }),
        EVENT_IS_SET => with(Svc::EventIsSet { event: EventId(p1) }, mem.out_word(p2)?),
        EVENT_DESTROY => plain(Svc::EventDestroy { event: EventId(p1) }),

        // Semaphore
        SEM_CREATE => with(Svc::SemCreate { value: p1 }, mem.out_word(p2)?),
        SEM_WAIT => plain(Svc::SemWait {
            sem: SemId(p1),
            timeout: timeout(p2),
        }),
        SEM_SIGNAL => plain(Svc::SemSignal { sem: SemId(p1) }),
        SEM_GET_VALUE => with(Svc::SemGetValue { sem: SemId(p1) }, mem.out_word(p2)?),
        SEM_DESTROY => plain(Svc::SemDestroy { sem: SemId(p1) }),

        // IPC
        IPC_POST => {
            let msg = message(mem.read_words::<5>(p2 as usize)?);
            plain(Svc::IpcPost { dest: pid, msg })
        }
        IPC_WAIT => {
            let [sender, cmd, param1] = mem.read_words::<3>(p1 as usize)?;
            let filter = IpcFilter::from_words(sender, cmd, param1);
            mem.check(p3 as usize, MESSAGE_SIZE)?;
            with(
                Svc::IpcWait {
                    filter,
                    timeout: timeout(p2),
                },
                Out::Message(p3 as usize),
            )
        }
        IPC_CALL => {
            let msg = message(mem.read_words::<5>(p2 as usize)?);
            with(
                Svc::IpcCall {
                    dest: pid,
                    msg,
                    timeout: timeout(p3),
                },
                Out::Message(p2 as usize),
            )
        }
        IPC_READ => {
            let [sender, cmd, param1] = mem.read_words::<3>(p1 as usize)?;
            let filter = IpcFilter::from_words(sender, cmd, param1);
            mem.check(p2 as usize, MESSAGE_SIZE)?;
            with(Svc::IpcRead { filter }, Out::Message(p2 as usize))
        }

        // Stream
        STREAM_CREATE => with(Svc::StreamCreate { size: p1 as usize }, mem.out_word(p2)?),
        STREAM_OPEN => with(
            Svc::StreamOpen {
                stream: StreamId(p1),
            },
            mem.out_word(p2)?,
        ),
        STREAM_CLOSE => plain(Svc::StreamClose {
            handle: StreamHandle(p1),
        }),
        STREAM_READ => {
            let (buf, cap, len_at) = mem.io(p2)?;
            mem.check(buf, cap)?;
            with(
                Svc::StreamRead {
                    handle: StreamHandle(p1),
                    size: cap,
                },
                Out::Io { buf, cap, len_at },
            )
        }
        STREAM_WRITE => {
            let (buf, len, len_at) = mem.io(p2)?;
            let data = mem.read(buf, len)?;
            with(
                Svc::StreamWrite {
                    handle: StreamHandle(p1),
                    data,
                },
                Out::Io {
                    buf,
                    cap: 0,
                    len_at,
                },
            )
        }
        STREAM_LISTEN => plain(Svc::StreamListen {
            handle: StreamHandle(p1),
            param: p2,
        }),
        STREAM_STOP_LISTEN => plain(Svc::StreamStopListen {
            handle: StreamHandle(p1),
        }),
        STREAM_FLUSH => plain(Svc::StreamFlush {
            handle: StreamHandle(p1),
        }),
        STREAM_GET_SIZE => with(
            Svc::StreamGetSize {
                handle: StreamHandle(p1),
            },
            mem.out_word(p2)?,
        ),
        STREAM_GET_FREE => with(
            Svc::StreamGetFree {
                handle: StreamHandle(p1),
            },
            mem.out_word(p2)?,
        ),
        STREAM_DESTROY => plain(Svc::StreamDestroy {
            stream: StreamId(p1),
        }),

        // Timer
        TIMER_GET_UPTIME => {
            mem.check(p1 as usize, TIME_SIZE)?;
            with(Svc::TimerGetUptime, Out::Time(p1 as usize))
        }
        SOFT_TIMER_CREATE => with(
            Svc::SoftTimerCreate {
                param: p1,
                flags: p2,
            },
            mem.out_word(p3)?,
        ),
        SOFT_TIMER_START => plain(Svc::SoftTimerStart {
            timer: SoftTimerId(p1),
            timeout: SysTime::new(p2, p3),
        }),
        SOFT_TIMER_STOP => plain(Svc::SoftTimerStop {
            timer: SoftTimerId(p1),
        }),
        SOFT_TIMER_DESTROY => plain(Svc::SoftTimerDestroy {
            timer: SoftTimerId(p1),
        }),

        // Object registry
        OBJECT_GET => with(
            Svc::ObjectGet {
                index: p1 as usize,
            },
            mem.out_word(p2)?,
        ),
        OBJECT_SET => plain(Svc::ObjectSet {
            index: p1 as usize,
            handle: p2,
        }),

        // Private pool
        POOL_MALLOC => with(Svc::Malloc { size: p1 as usize }, mem.out_word(p2)?),
        POOL_FREE => plain(Svc::Free { addr: p1 as usize }),
        POOL_REALLOC => with(
            Svc::Realloc {
                addr: p1 as usize,
                size: p2 as usize,
            },
            mem.out_word(p3)?,
        ),

        // Block
        BLOCK_CREATE => with(Svc::BlockCreate { size: p1 as usize }, mem.out_word(p2)?),
        BLOCK_OPEN => with(Svc::BlockOpen { block: BlockId(p1) }, mem.out_word(p2)?),
        BLOCK_CLOSE => plain(Svc::BlockClose { block: BlockId(p1) }),
        BLOCK_SEND => plain(Svc::BlockSend {
            block: BlockId(p1),
            to: ProcessId(p2),
        }),
        BLOCK_SEND_TO_OWNER => plain(Svc::BlockSendToOwner { block: BlockId(p1) }),
        BLOCK_DESTROY => plain(Svc::BlockDestroy { block: BlockId(p1) }),
        BLOCK_GET_SIZE => with(Svc::BlockGetSize { block: BlockId(p1) }, mem.out_word(p2)?),
        BLOCK_GET_DATA_SIZE => with(
            Svc::BlockGetDataSize { block: BlockId(p1) },
            mem.out_word(p2)?,
        ),
        BLOCK_SET_DATA_SIZE => plain(Svc::BlockSetDataSize {
            block: BlockId(p1),
            size: p2 as usize,
        }),

        // Debug
        DEBUG_WRITE => {
            let len = (p2 as usize).min(MAX_DEBUG_LEN);
            let bytes = mem.read(p1 as usize, len)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            plain(Svc::DebugWrite { text })
        }
        DEBUG_SETUP => plain(Svc::DebugSetup { enabled: p1 != 0 }),

        _ => Err(KernelError::InvalidParams),
    }
}
