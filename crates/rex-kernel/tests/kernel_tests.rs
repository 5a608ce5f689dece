//! Kernel integration tests
//!
//! Drive `System` through raw SVC words the way unprivileged code does,
//! against a recording mock HAL.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use rex_hal::{HalError, IrqState, HAL};
use rex_kernel::abi::MESSAGE_SIZE;
use rex_kernel::{KernelConfig, KernelError, System};
use rex_kernel_core::svc::opcode::*;
use rex_kernel_core::{
    check_all_invariants, ipc_cmd, IpcMessage, PanicPolicy, PanicReason, ProcessId,
    ERROR_OK, ERROR_SYNC, IPC_ANY, REX_FLAG_ACTIVE,
};
use rex_unsafe_primitives::region_from_raw;

// ============================================================================
// Mock HAL for Testing
// ============================================================================

const RAM_BASE: usize = 0x2000_0000;
const RAM_SIZE: usize = 32 * 1024;
const POOL_SIZE: usize = 16 * 1024;

pub struct MockHal {
    irq: Cell<bool>,
    elapsed: Cell<u32>,
    hpet: Cell<Option<u32>>,
    ram: RefCell<Vec<u8>>,
    switches: RefCell<Vec<(Option<u32>, u32)>>,
    results: RefCell<Vec<(u32, u32)>>,
    debug_log: RefCell<Vec<String>>,
    halted: Cell<bool>,
    resets: Cell<u32>,
    sp: Cell<Option<usize>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            irq: Cell::new(true),
            elapsed: Cell::new(0),
            hpet: Cell::new(None),
            ram: RefCell::new(alloc::vec![0; RAM_SIZE]),
            switches: RefCell::new(Vec::new()),
            results: RefCell::new(Vec::new()),
            debug_log: RefCell::new(Vec::new()),
            halted: Cell::new(false),
            resets: Cell::new(0),
            sp: Cell::new(None),
        }
    }

    fn range(&self, addr: usize, len: usize) -> Result<core::ops::Range<usize>, HalError> {
        let start = addr.checked_sub(RAM_BASE).ok_or(HalError::BadAddress)?;
        let end = start.checked_add(len).ok_or(HalError::BadAddress)?;
        if end > RAM_SIZE {
            return Err(HalError::BadAddress);
        }
        Ok(start..end)
    }

    fn last_result(&self, pid: ProcessId) -> Option<u32> {
        self.results
            .borrow()
            .iter()
            .rev()
            .find(|(p, _)| *p == pid.0)
            .map(|(_, code)| *code)
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl HAL for MockHal {
    fn critical_enter(&self) -> IrqState {
        self.irq.replace(false)
    }

    fn critical_exit(&self, state: IrqState) {
        self.irq.set(state);
    }

    fn switch_context(&self, from: Option<u32>, to: u32) {
        self.switches.borrow_mut().push((from, to));
    }

    fn stack_pointer(&self, _pid: u32) -> Option<usize> {
        self.sp.get()
    }

    fn hpet_start(&self, us: u32) {
        self.hpet.set(Some(us));
    }

    fn hpet_stop(&self) {
        self.hpet.set(None);
    }

    fn hpet_elapsed(&self) -> u32 {
        self.elapsed.get()
    }

    fn copy_from_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), HalError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.ram.borrow()[range]);
        Ok(())
    }

    fn copy_to_user(&self, addr: usize, data: &[u8]) -> Result<(), HalError> {
        let range = self.range(addr, data.len())?;
        self.ram.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn map_region(&self, base: usize, size: usize) -> Result<&'static mut [u8], HalError> {
        self.range(base, size)?;
        // pool bookkeeping lives in its own leaked buffer, user data in `ram`
        let backing: &'static mut [u32] = Box::leak(alloc::vec![0u32; size / 4].into_boxed_slice());
        unsafe { region_from_raw(backing.as_mut_ptr() as usize, size & !3) }
            .map_err(|_| HalError::InvalidArgument)
    }

    fn set_svc_result(&self, pid: u32, code: u32) {
        self.results.borrow_mut().push((pid, code));
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }

    fn halt(&self) {
        self.halted.set(true);
    }

    fn reset(&self) {
        self.resets.set(self.resets.get() + 1);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn boot() -> System<MockHal> {
    boot_with(KernelConfig::default())
}

fn boot_with(config: KernelConfig) -> System<MockHal> {
    System::new(MockHal::new(), config, RAM_BASE, POOL_SIZE).expect("kernel boots")
}

/// Scratch memory of the running process
fn scratch(sys: &System<MockHal>, offset: usize) -> usize {
    let pid = sys.current().expect("a process runs");
    sys.kernel().process(pid).expect("process exists").region + offset
}

fn poke_words(sys: &System<MockHal>, addr: usize, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    sys.hal().copy_to_user(addr, &bytes).expect("in RAM");
}

fn peek(sys: &System<MockHal>, addr: usize, len: usize) -> Vec<u8> {
    let mut buf = alloc::vec![0; len];
    sys.hal().copy_from_user(addr, &mut buf).expect("in RAM");
    buf
}

fn peek_word(sys: &System<MockHal>, addr: usize) -> u32 {
    let b = peek(sys, addr, 4);
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Call that stores one word; returns it
fn call_out(sys: &mut System<MockHal>, op: u32, p1: u32, out_param: usize) -> u32 {
    let out = scratch(sys, 0x300);
    let code = match out_param {
        1 => sys.svc(op, out as u32, 0, 0),
        2 => sys.svc(op, p1, out as u32, 0),
        _ => unreachable!(),
    };
    assert_eq!(code, ERROR_OK, "op {:#06x}", op);
    peek_word(sys, out)
}

/// Create a process from the running one
fn spawn(sys: &mut System<MockHal>, name: &str, priority: u8, flags: u32) -> ProcessId {
    let name_at = scratch(sys, 0x200);
    let desc_at = scratch(sys, 0x240);
    let out = scratch(sys, 0x260);
    sys.hal().copy_to_user(name_at, name.as_bytes()).expect("in RAM");
    poke_words(
        sys,
        desc_at,
        &[name_at as u32, name.len() as u32, 1024, priority as u32, flags, 4],
    );
    let code = sys.svc(PROCESS_CREATE, desc_at as u32, out as u32, 0);
    assert_eq!(code, ERROR_OK);
    ProcessId(peek_word(sys, out))
}

fn priority(sys: &System<MockHal>, pid: ProcessId) -> u8 {
    sys.kernel().process(pid).expect("process exists").current_priority.0
}

fn assert_invariants(sys: &System<MockHal>) {
    let violations = check_all_invariants(sys.kernel());
    assert!(violations.is_empty(), "{:?}", violations);
}

// ============================================================================
// Boot and trap path
// ============================================================================

#[test]
fn test_boot_runs_root() {
    let sys = boot();
    let root = sys.kernel().root();
    assert_eq!(sys.current(), Some(root));
    assert_eq!(*sys.hal().switches.borrow(), [(None, root.0)]);
    assert!(sys.hal().irq.get());
    assert_invariants(&sys);
}

#[test]
fn test_foreign_pointer_rejected_and_recorded() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let outside = (RAM_BASE + RAM_SIZE - 16) as u32;

    assert_eq!(sys.svc(MUTEX_CREATE, outside, 0, 0), KernelError::AccessDenied.code());
    assert_eq!(sys.last_error(root), Ok(Some(KernelError::AccessDenied)));
    assert_eq!(
        call_out(&mut sys, PROCESS_GET_LAST_ERROR, 0, 1),
        KernelError::AccessDenied.code()
    );
    assert!(sys.kernel().mutexes.is_empty());
}

#[test]
fn test_unknown_opcode() {
    let mut sys = boot();
    assert_eq!(sys.svc(0x7777, 0, 0, 0), KernelError::InvalidParams.code());
}

#[test]
fn test_debug_write_reaches_console() {
    let mut sys = boot();
    let text = scratch(&sys, 0x100);
    sys.hal().copy_to_user(text, b"hello").unwrap();
    assert_eq!(sys.svc(DEBUG_WRITE, text as u32, 5, 0), ERROR_OK);
    assert!(sys.hal().debug_log.borrow().iter().any(|l| l == "[init] hello"));
}

#[test]
fn test_pool_register_extends_system_memory() {
    let mut sys = boot();
    let base = (RAM_BASE + POOL_SIZE) as u32;
    assert_eq!(sys.svc(POOL_REGISTER, base, 4096, 0), ERROR_OK);
    assert_eq!(sys.kernel().pools.len(), 2);
    assert_eq!(
        sys.svc(POOL_REGISTER, base + 64, 64, 0),
        KernelError::AlreadyConfigured.code()
    );

    // only the root may register
    let worker = spawn(&mut sys, "worker", 3, REX_FLAG_ACTIVE);
    sys.trap_return();
    assert_eq!(sys.current(), Some(worker));
    assert_eq!(
        sys.svc(POOL_REGISTER, base + 8192, 1024, 0),
        KernelError::AccessDenied.code()
    );
}

#[test]
fn test_switch_saves_in_range_stack_pointer() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let worker = spawn(&mut sys, "worker", 3, REX_FLAG_ACTIVE);
    let sp = scratch(&sys, 0x380);
    sys.hal().sp.set(Some(sp));
    sys.trap_return();
    assert_eq!(sys.current(), Some(worker));
    assert_eq!(sys.kernel().process(root).unwrap().stack_pointer, sp);
}

#[test]
fn test_switch_proceeds_past_stray_stack_pointer() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let before = sys.kernel().process(root).unwrap().stack_pointer;
    let worker = spawn(&mut sys, "worker", 3, REX_FLAG_ACTIVE);
    sys.hal().sp.set(Some(0x10));
    sys.trap_return();
    assert_eq!(sys.current(), Some(worker));
    assert_eq!(sys.kernel().process(root).unwrap().stack_pointer, before);
    assert_invariants(&sys);
}

// ============================================================================
// Scenarios
// ============================================================================

/// Ready order follows priority regardless of creation order
#[test]
fn test_scenario_a_ready_order() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let p10 = spawn(&mut sys, "p10", 10, REX_FLAG_ACTIVE);
    let p5 = spawn(&mut sys, "p5", 5, REX_FLAG_ACTIVE);
    let p20 = spawn(&mut sys, "p20", 20, REX_FLAG_ACTIVE);
    assert_eq!(sys.kernel().ready.pids(), [p5, p10, p20, root]);

    assert_eq!(sys.svc(PROCESS_DESTROY, p5.0, 0, 0), ERROR_OK);
    assert_eq!(sys.kernel().ready.pids(), [p10, p20, root]);

    sys.trap_return();
    assert_eq!(sys.current(), Some(p10));
    assert_invariants(&sys);
}

/// Priority inheritance on a contended mutex
#[test]
fn test_scenario_b_priority_inheritance() {
    let mut sys = boot();
    let mutex = call_out(&mut sys, MUTEX_CREATE, 0, 1);
    let p1 = spawn(&mut sys, "p1", 20, 0);
    let p2 = spawn(&mut sys, "p2", 5, 0);

    assert_eq!(sys.svc(PROCESS_SET_FLAGS, p1.0, REX_FLAG_ACTIVE, 0), ERROR_OK);
    sys.trap_return();
    assert_eq!(sys.current(), Some(p1));
    assert_eq!(sys.svc(MUTEX_LOCK, mutex, 0, 0), ERROR_OK);

    assert_eq!(sys.svc(PROCESS_SET_FLAGS, p2.0, REX_FLAG_ACTIVE, 0), ERROR_OK);
    sys.trap_return();
    assert_eq!(sys.current(), Some(p2));
    assert_eq!(sys.svc(MUTEX_LOCK, mutex, 0, 0), ERROR_SYNC);
    assert_eq!(priority(&sys, p1), 5);
    assert_invariants(&sys);

    sys.trap_return();
    assert_eq!(sys.current(), Some(p1));
    assert_eq!(sys.svc(MUTEX_UNLOCK, mutex, 0, 0), ERROR_OK);
    assert_eq!(priority(&sys, p1), 20);
    assert_eq!(
        sys.kernel().mutexes.values().next().and_then(|m| m.owner),
        Some(p2)
    );

    sys.trap_return();
    assert_eq!(sys.current(), Some(p2));
    assert_eq!(sys.hal().last_result(p2), Some(ERROR_OK));
    assert_invariants(&sys);
}

/// Buffered stream bytes are returned by a larger read without blocking
#[test]
fn test_scenario_c_stream_partial_read() {
    let mut sys = boot();
    let stream = call_out(&mut sys, STREAM_CREATE, 8, 2);
    let handle = call_out(&mut sys, STREAM_OPEN, stream, 2);

    let data = scratch(&sys, 0x100);
    let io = scratch(&sys, 0x140);
    sys.hal().copy_to_user(data, b"hello").unwrap();
    poke_words(&sys, io, &[data as u32, 5]);
    assert_eq!(sys.svc(STREAM_WRITE, handle, io as u32, 0), ERROR_OK);
    assert_eq!(peek_word(&sys, io + 4), 5);
    assert_eq!(call_out(&mut sys, STREAM_GET_SIZE, handle, 2), 5);

    let buf = scratch(&sys, 0x180);
    poke_words(&sys, io, &[buf as u32, 8]);
    assert_eq!(sys.svc(STREAM_READ, handle, io as u32, 0), ERROR_OK);
    assert_eq!(peek_word(&sys, io + 4), 5);
    assert_eq!(peek(&sys, buf, 5), b"hello");
    assert_eq!(call_out(&mut sys, STREAM_GET_FREE, handle, 2), 8);
}

/// Semaphore wait times out, or wakes with the unit consumed
#[test]
fn test_scenario_d_semaphore_timeout_and_signal() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let sem = call_out(&mut sys, SEM_CREATE, 0, 2);
    let waiter = spawn(&mut sys, "waiter", 3, REX_FLAG_ACTIVE);
    sys.trap_return();
    assert_eq!(sys.current(), Some(waiter));

    // timeout
    assert_eq!(sys.svc(SEM_WAIT, sem, 100, 0), ERROR_SYNC);
    assert_eq!(sys.hal().hpet.get(), Some(100_000));
    sys.trap_return();
    assert_eq!(sys.current(), Some(root));

    sys.hal().elapsed.set(100_000);
    sys.on_hpet_timeout();
    sys.trap_return();
    assert_eq!(sys.current(), Some(waiter));
    assert_eq!(sys.hal().last_result(waiter), Some(KernelError::Timeout.code()));
    assert_eq!(sys.last_error(waiter), Ok(Some(KernelError::Timeout)));

    // signal before expiry
    assert_eq!(sys.svc(SEM_WAIT, sem, 100, 0), ERROR_SYNC);
    sys.trap_return();
    assert_eq!(sys.current(), Some(root));
    assert_eq!(sys.svc(SEM_SIGNAL, sem, 0, 0), ERROR_OK);
    sys.trap_return();
    assert_eq!(sys.current(), Some(waiter));
    assert_eq!(sys.hal().last_result(waiter), Some(ERROR_OK));
    assert_eq!(call_out(&mut sys, SEM_GET_VALUE, sem, 2), 0);
    assert!(sys.kernel().timers.is_empty());
    assert_invariants(&sys);
}

// ============================================================================
// IPC through the trap path
// ============================================================================

#[test]
fn test_ipc_wait_delivers_message_on_resume() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let server = spawn(&mut sys, "server", 2, REX_FLAG_ACTIVE);
    sys.trap_return();

    let filter = scratch(&sys, 0x100);
    let out = scratch(&sys, 0x120);
    poke_words(&sys, filter, &[IPC_ANY, IPC_ANY, IPC_ANY]);
    assert_eq!(sys.svc(IPC_WAIT, filter as u32, 0, out as u32), ERROR_SYNC);
    sys.trap_return();
    assert_eq!(sys.current(), Some(root));

    let msg = scratch(&sys, 0x100);
    poke_words(&sys, msg, &[0, ipc_cmd::IPC_USER, 1, 2, 3]);
    assert_eq!(sys.svc(IPC_POST, server.0, msg as u32, 0), ERROR_OK);
    sys.trap_return();
    assert_eq!(sys.current(), Some(server));

    let words: Vec<u32> = peek(&sys, out, MESSAGE_SIZE)
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(words, [root.0, ipc_cmd::IPC_USER, 1, 2, 3]);
    assert_eq!(sys.hal().last_result(server), Some(ERROR_OK));
}

#[test]
fn test_isr_post_and_overflow() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let ipc = sys.kernel().config.root_ipc_size;
    for i in 0..ipc as u32 {
        sys.ipc_post_isr(root, IpcMessage::new(ipc_cmd::IPC_USER, i, 0, 0))
            .unwrap();
    }
    assert_eq!(
        sys.ipc_post_isr(root, IpcMessage::new(ipc_cmd::IPC_USER, 99, 0, 0)),
        Err(KernelError::Overflow)
    );
    assert!(sys.panicked().is_none());
}

#[test]
fn test_soft_timer_expiry_across_a_second() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let out = scratch(&sys, 0x300);
    assert_eq!(sys.svc(SOFT_TIMER_CREATE, 7, 0, out as u32), ERROR_OK);
    let timer = peek_word(&sys, out);

    assert_eq!(sys.svc(SOFT_TIMER_START, timer, 1, 500_000), ERROR_OK);
    assert_eq!(sys.hal().hpet.get(), None);

    sys.on_second_pulse();
    assert_eq!(sys.hal().hpet.get(), Some(500_000));

    sys.hal().elapsed.set(500_000);
    sys.on_hpet_timeout();
    assert!(sys.kernel().timers.is_empty());

    let filter = scratch(&sys, 0x100);
    let msg = scratch(&sys, 0x120);
    poke_words(&sys, filter, &[IPC_ANY, ipc_cmd::IPC_TIMEOUT, IPC_ANY]);
    assert_eq!(sys.svc(IPC_READ, filter as u32, msg as u32, 0), ERROR_OK);
    assert_eq!(peek_word(&sys, msg + 4), ipc_cmd::IPC_TIMEOUT);
    assert_eq!(peek_word(&sys, msg + 8), timer);
    assert_eq!(peek_word(&sys, msg + 12), 7);
    assert_eq!(sys.current(), Some(root));

    let time = scratch(&sys, 0x140);
    assert_eq!(sys.svc(TIMER_GET_UPTIME, time as u32, 0, 0), ERROR_OK);
    assert_eq!(peek_word(&sys, time), 1);
    assert_eq!(peek_word(&sys, time + 4), 500_000);
}

// ============================================================================
// Faults and the panic path
// ============================================================================

#[test]
fn test_fault_destroys_only_the_faulting_process() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let app = spawn(&mut sys, "app", 4, REX_FLAG_ACTIVE);
    sys.trap_return();
    assert_eq!(sys.current(), Some(app));

    sys.on_fault();
    assert!(sys.kernel().process(app).is_err());
    sys.trap_return();
    assert_eq!(sys.current(), Some(root));
    assert!(sys.panicked().is_none());
}

#[test]
fn test_destroying_root_halts_in_debug_policy() {
    let mut sys = boot_with(KernelConfig::default().with_panic_policy(PanicPolicy::Halt));
    let root = sys.kernel().root();
    let code = sys.svc(PROCESS_DESTROY, root.0, 0, 0);
    assert_eq!(
        code,
        KernelError::Panic(PanicReason::RootProcessDestroyed).code()
    );
    assert!(sys.hal().halted.get());
    assert_eq!(sys.hal().resets.get(), 0);
}

#[test]
fn test_recursive_lock_resets_in_release_policy() {
    let mut sys = boot_with(KernelConfig::default().with_panic_policy(PanicPolicy::Reset));
    let mutex = call_out(&mut sys, MUTEX_CREATE, 0, 1);
    assert_eq!(sys.svc(MUTEX_LOCK, mutex, 0, 0), ERROR_OK);
    sys.svc(MUTEX_LOCK, mutex, 0, 0);
    assert!(matches!(sys.panicked(), Some(KernelError::Panic(_))));
    assert_eq!(sys.hal().resets.get(), 1);
}

// ============================================================================
// Blocks through the trap path
// ============================================================================

#[test]
fn test_block_mapping_gates_user_copies() {
    let mut sys = boot();
    let root = sys.kernel().root();
    let peer = spawn(&mut sys, "peer", 200, REX_FLAG_ACTIVE);

    let block = call_out(&mut sys, BLOCK_CREATE, 64, 2);
    let addr = call_out(&mut sys, BLOCK_OPEN, block, 2) as usize;

    // the mapped block is valid memory for pointer arguments
    sys.hal().copy_to_user(addr, b"ping").unwrap();
    assert_eq!(sys.svc(DEBUG_WRITE, addr as u32, 4, 0), ERROR_OK);

    assert_eq!(sys.svc(BLOCK_SEND, block, peer.0, 0), ERROR_OK);
    assert_eq!(
        sys.svc(DEBUG_WRITE, addr as u32, 4, 0),
        KernelError::AccessDenied.code()
    );
    assert_eq!(sys.kernel().blocks.values().next().map(|b| b.granted), Some(peer));
    assert_eq!(sys.current(), Some(root));
}
