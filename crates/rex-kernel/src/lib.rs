//! Rex Kernel - runtime wrapper around the pure kernel core
//!
//! `System` binds a `rex_kernel_core::Kernel` to a HAL. It owns the trap
//! path (raw SVC words in, status word out), the interrupt entry points,
//! the context-switch request, and the panic path. Every call into the core
//! happens inside a HAL critical section, and every `Effect` the core emits
//! is applied before the section ends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          SYSTEM                             │
//! │                                                             │
//! │   svc(opcode, p1, p2, p3)        IRQ: second pulse, HPET,   │
//! │        │                              fault, ISR post       │
//! │        ▼                                   │                │
//! │   ┌──────────────┐                         │                │
//! │   │  abi::decode │  pointer checks,        │                │
//! │   │              │  copy in via HAL        │                │
//! │   └──────────────┘                         │                │
//! │        │ Svc                               │                │
//! │        ▼                                   ▼                │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │               Kernel (rex-kernel-core)            │     │
//! │   └───────────────────────────────────────────────────┘     │
//! │        │ SvcResult                         │ Effects        │
//! │        ▼                                   ▼                │
//! │   out-pointers / ERROR_SYNC       SwitchRequest, HPET,      │
//! │                                   debug console             │
//! │                                                             │
//! │   trap_return: switch if pending, deliver parked results    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A call that parks returns `ERROR_SYNC`; its real status and out-values
//! are delivered by `trap_return` once the process runs again.

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

pub mod abi;

use alloc::collections::BTreeMap;
use log::{debug, error, info, trace, warn, LevelFilter};

use rex_hal::HAL;
use rex_kernel_core::svc::opcode;
use rex_kernel_core::{
    Effect, ERROR_OK, ERROR_SYNC, IpcMessage, Kernel, KernelSnapshot, PanicPolicy, ProcessId,
    Region, SvcResult, SysTime,
};
use rex_unsafe_primitives::SwitchRequest;

use crate::abi::{Out, UserMemory};

// Re-export HAL types
pub use rex_hal::{HalError, TestHal, HAL as HalTrait};

// Re-export the core API used by boards and tests
pub use rex_kernel_core::{KernelConfig, KernelError, PanicReason};

/// A kernel bound to its hardware
pub struct System<H: HAL> {
    hal: H,
    kernel: Kernel,
    switch: SwitchRequest,
    /// Out-locations of parked calls
    pending: BTreeMap<ProcessId, Out>,
    panicked: Option<KernelError>,
}

impl<H: HAL> System<H> {
    /// Boot over the first system pool and start the root process.
    pub fn new(
        hal: H,
        config: KernelConfig,
        pool_base: usize,
        pool_size: usize,
    ) -> Result<Self, KernelError> {
        let region = hal.map_region(pool_base, pool_size).map_err(|e| {
            error!("cannot map system pool at {:#x}: {}", pool_base, e);
            KernelError::InvalidParams
        })?;
        let kernel = Kernel::new(config, pool_base, Region::Fixed(region))?;
        info!(
            "rex kernel up: pool {:#x}+{:#x}, root {}",
            pool_base,
            pool_size,
            kernel.root()
        );

        let mut system = Self {
            hal,
            kernel,
            switch: SwitchRequest::new(),
            pending: BTreeMap::new(),
            panicked: None,
        };
        system.switch.request();
        system.trap_return();
        Ok(system)
    }

    /// Install the HAL-backed `log` backend.
    pub fn init_logging(hal: &'static H, level: LevelFilter) -> Result<(), HalError> {
        rex_hal::init_logger(hal, level)
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Direct core access for board bring-up and tests
    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.kernel.current()
    }

    pub fn last_error(&self, pid: ProcessId) -> Result<Option<KernelError>, KernelError> {
        self.kernel.last_error(pid)
    }

    /// Fatal error that took the panic path, if any
    pub fn panicked(&self) -> Option<KernelError> {
        self.panicked
    }

    /// Uptime including the hardware counter
    pub fn uptime(&mut self) -> SysTime {
        self.locked(|sys| {
            sys.kernel.set_elapsed(sys.hal.hpet_elapsed());
            sys.kernel.now()
        })
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        self.kernel.snapshot()
    }

    // ========================================================================
    // Trap path
    // ========================================================================

    /// Supervisor call from the running process.
    ///
    /// Returns `ERROR_OK`, `ERROR_SYNC` when the call parked, or an error code.
    pub fn svc(&mut self, opcode: u32, p1: u32, p2: u32, p3: u32) -> u32 {
        self.locked(|sys| sys.svc_locked(opcode, p1, p2, p3))
    }

    fn svc_locked(&mut self, op: u32, p1: u32, p2: u32, p3: u32) -> u32 {
        let Some(caller) = self.kernel.current() else {
            warn!("svc {:#06x} with no running process", op);
            return KernelError::NotActive.code();
        };
        self.kernel.set_elapsed(self.hal.hpet_elapsed());
        trace!("svc {:#06x} from {} ({:#x}, {:#x}, {:#x})", op, caller, p1, p2, p3);

        if op == opcode::POOL_REGISTER {
            let result = self.register_pool(caller, p1 as usize, p2 as usize);
            return self.reject_or_ok(caller, result.err());
        }

        let decoded = {
            let mem = UserMemory::new(&self.hal, &self.kernel, caller);
            abi::decode(&mem, op, p1, p2, p3)
        };
        match decoded {
            Ok(d) => {
                let result = self.kernel.svc(caller, d.svc);
                self.complete(caller, d.out, result)
            }
            Err(e) => {
                debug!("svc {:#06x} from {} rejected: {}", op, caller, e);
                self.reject_or_ok(caller, Some(e))
            }
        }
    }

    fn reject_or_ok(&mut self, caller: ProcessId, err: Option<KernelError>) -> u32 {
        if let Err(e) = self.kernel.set_last_error(caller, err) {
            warn!("cannot record result for {}: {}", caller, e);
        }
        err.map_or(ERROR_OK, |e| e.code())
    }

    /// Turn a call result into the status word, storing out-values.
    fn complete(&mut self, pid: ProcessId, out: Out, result: SvcResult) -> u32 {
        match result {
            SvcResult::Blocked => {
                self.pending.insert(pid, out);
                ERROR_SYNC
            }
            SvcResult::Err(e) => {
                if e.is_fatal() {
                    self.panic(e);
                }
                e.code()
            }
            ok => {
                let delivered = UserMemory::new(&self.hal, &self.kernel, pid).deliver(out, &ok);
                match delivered {
                    Ok(()) => ERROR_OK,
                    Err(e) => {
                        warn!("result for {} lost: {}", pid, e);
                        self.reject_or_ok(pid, Some(e))
                    }
                }
            }
        }
    }

    /// Register a RAM range as another system pool. Root only.
    pub fn register_pool(
        &mut self,
        caller: ProcessId,
        base: usize,
        size: usize,
    ) -> Result<usize, KernelError> {
        if caller != self.kernel.root() {
            return Err(KernelError::AccessDenied);
        }
        self.kernel.check_pool_range(base, size)?;
        let region = self
            .hal
            .map_region(base, size)
            .map_err(|_| KernelError::InvalidParams)?;
        self.kernel.add_pool(base, Region::Fixed(region))
    }

    /// Return to thread context: switch if a switch is pending, then hand
    /// the running process the result of a call that completed while it
    /// was parked.
    pub fn trap_return(&mut self) {
        self.locked(|sys| {
            if sys.switch.take_for_thread() {
                if let Some((from, to)) = sys.kernel.schedule() {
                    if let Some(from) = from {
                        if let Some(sp) = sys.hal.stack_pointer(from.0) {
                            if let Err(e) = sys.kernel.set_stack_pointer(from, sp) {
                                warn!("stack pointer {:#x} of {} ignored: {}", sp, from, e);
                            }
                        }
                    }
                    sys.hal.switch_context(from.map(|p| p.0), to.0);
                }
                let live = &sys.kernel.processes;
                sys.pending.retain(|pid, _| live.contains_key(pid));
            }
            if let Some(pid) = sys.kernel.current() {
                sys.resume(pid);
            }
        })
    }

    fn resume(&mut self, pid: ProcessId) {
        let Some(result) = self.kernel.take_resume(pid) else {
            return;
        };
        let out = self.pending.remove(&pid).unwrap_or(Out::None);
        let code = self.complete(pid, out, result);
        self.hal.set_svc_result(pid.0, code);
    }

    // ========================================================================
    // Interrupt entry points
    // ========================================================================

    /// 1 Hz uptime pulse
    pub fn on_second_pulse(&mut self) {
        self.run_timers(|k| k.begin_second_pulse());
    }

    /// One-shot hardware timer expiry
    pub fn on_hpet_timeout(&mut self) {
        let elapsed = self.hal.hpet_elapsed();
        self.run_timers(|k| k.begin_hpet_timeout(elapsed));
    }

    /// Processor fault while `current` was running
    pub fn on_fault(&mut self) {
        let current = self.kernel.current();
        self.isr(|k| k.on_fault(current)).ok();
    }

    /// Post an IPC message from interrupt context
    pub fn ipc_post_isr(&mut self, dest: ProcessId, msg: IpcMessage) -> Result<(), KernelError> {
        self.isr(|k| k.ipc_post_isr(dest, msg))
    }

    fn isr<R>(
        &mut self,
        f: impl FnOnce(&mut Kernel) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        self.switch.irq_enter();
        let result = self.locked(|sys| {
            let result = f(&mut sys.kernel);
            if let Err(e) = &result {
                sys.isr_failed(*e);
            }
            result
        });
        self.switch.irq_exit();
        result
    }

    /// Fire due deadlines one per critical section, so other interrupts
    /// are served between callbacks.
    fn run_timers(&mut self, begin: impl FnOnce(&mut Kernel)) {
        self.switch.irq_enter();
        self.locked(|sys| begin(&mut sys.kernel));
        let mut fired = 0usize;
        while self.locked(|sys| match sys.kernel.pop_due_timer() {
            Some(entry) => {
                if let Err(e) = sys.kernel.fire_timer(entry) {
                    sys.isr_failed(e);
                }
                true
            }
            None => {
                sys.kernel.finish_timers();
                false
            }
        }) {
            fired += 1;
        }
        trace!("{} deadlines fired", fired);
        self.switch.irq_exit();
    }

    fn isr_failed(&mut self, err: KernelError) {
        if err.is_fatal() {
            self.panic(err);
        } else {
            warn!("interrupt handler failed: {}", err);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let irq = self.hal.critical_enter();
        let r = f(self);
        self.apply_effects();
        self.hal.critical_exit(irq);
        r
    }

    fn apply_effects(&mut self) {
        for effect in self.kernel.take_effects() {
            match effect {
                Effect::PendSwitch => self.switch.request(),
                Effect::HpetStart(us) => self.hal.hpet_start(us),
                Effect::HpetStop => self.hal.hpet_stop(),
                Effect::Debug(line) => self.hal.debug_write(&line),
            }
        }
    }

    fn panic(&mut self, err: KernelError) {
        error!("kernel panic: {}", err);
        self.panicked = Some(err);
        match self.kernel.config.panic_policy {
            PanicPolicy::Halt => self.hal.halt(),
            PanicPolicy::Reset => self.hal.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM: usize = TestHal::DEFAULT_RAM_BASE;

    fn boot() -> System<TestHal> {
        System::new(TestHal::new(), KernelConfig::default(), RAM, 16 * 1024).unwrap()
    }

    #[test]
    fn test_boot_switches_to_root() {
        let sys = boot();
        let root = sys.kernel().root();
        assert_eq!(sys.current(), Some(root));
        assert_eq!(sys.hal().switches(), [(None, root.0)]);
        assert!(sys.hal().irq_enabled());
    }

    #[test]
    fn test_svc_without_decoding_errors() {
        let mut sys = boot();
        let root = sys.kernel().root();
        let out = sys.kernel().process(root).unwrap().region + 16;

        assert_eq!(sys.svc(opcode::SEM_CREATE, 2, out as u32, 0), ERROR_OK);
        let mut word = [0u8; 4];
        sys.hal().copy_from_user(out, &mut word).unwrap();
        assert_ne!(u32::from_le_bytes(word), 0);
    }

    #[test]
    fn test_pool_register_root_only() {
        let mut sys = boot();
        let root = sys.kernel().root();
        assert_eq!(sys.register_pool(root, RAM + 0x8000, 1024), Ok(1));
        assert_eq!(
            sys.register_pool(root, RAM + 0x8100, 64),
            Err(KernelError::AlreadyConfigured)
        );
        assert_eq!(
            sys.register_pool(ProcessId(999), RAM + 0x9000, 64),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn test_unattributed_fault_takes_panic_path() {
        let mut sys = System::new(
            TestHal::new(),
            KernelConfig::default().with_panic_policy(PanicPolicy::Reset),
            RAM,
            16 * 1024,
        )
        .unwrap();
        sys.isr(|k| k.on_fault(None)).ok();
        assert_eq!(
            sys.panicked(),
            Some(KernelError::Panic(PanicReason::UnattributedFault))
        );
        assert_eq!(sys.hal().reset_count(), 1);
        assert!(!sys.hal().is_halted());
    }
}
