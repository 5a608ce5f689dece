//! Hardware Abstraction Layer trait for the Rex kernel
//!
//! This crate defines the HAL trait that lets the kernel run on different
//! single-core targets (Cortex-M, RISC-V MCUs, host simulation) by
//! abstracting the few hardware operations the core depends on.
//!
//! # Collaborators
//!
//! - **Critical section**: global interrupt disable/enable (the only lock on a single core)
//! - **Context switch**: save the current register file, load the next process
//! - **HPET**: one-shot hardware timer triple `{start, stop, elapsed}`
//! - **User memory**: copy in/out of a process's registered region
//! - **Memory regions**: board RAM ranges handed to the kernel as pools
//! - **Trap return**: the status word a resumed process sees
//! - **Debug output**: raw text sink used by the logger
//! - **Panic path**: halt (debug builds) or full system reset

#![no_std]

extern crate alloc;

pub mod logger;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

pub use logger::{init_logger, DebugSink, HalLogger};

/// Interrupt enable state captured by `critical_enter`
pub type IrqState = bool;

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Critical sections
/// - Context switching between processes
/// - The one-shot hardware timer
/// - Access to process memory
/// - Debug output and the panic path
///
/// Processes are identified by their raw kernel handle (`u32`), so the HAL
/// has no dependency on kernel types.
pub trait HAL: Send + Sync + 'static {
    // === Critical Section ===

    /// Disable interrupts, returning the previous enable state
    fn critical_enter(&self) -> IrqState;

    /// Restore the interrupt enable state returned by `critical_enter`
    fn critical_exit(&self, state: IrqState);

    // === Context Switch ===

    /// Save the register file of `from` (if any) and make `to` active.
    ///
    /// Invoked atomically with respect to interrupts. On hardware this
    /// pends the switch exception; the actual swap happens on trap return.
    fn switch_context(&self, from: Option<u32>, to: u32);

    /// Saved stack pointer of a process, if the platform tracks it
    fn stack_pointer(&self, _pid: u32) -> Option<usize> {
        None
    }

    // === Hardware Timer ===

    /// Arm the one-shot timer to fire after `us` microseconds
    fn hpet_start(&self, us: u32);

    /// Disarm the one-shot timer
    fn hpet_stop(&self);

    /// Microseconds elapsed since the last 1 Hz pulse
    fn hpet_elapsed(&self) -> u32;

    // === User Memory ===

    /// Copy bytes out of process memory at `addr`
    ///
    /// The kernel validates `addr` against the caller's region before calling.
    fn copy_from_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), HalError>;

    /// Copy bytes into process memory at `addr`
    fn copy_to_user(&self, addr: usize, data: &[u8]) -> Result<(), HalError>;

    // === Memory Regions ===

    /// Hand out `[base, base + size)` as a kernel-owned byte slice.
    ///
    /// Called once per system pool. Boards without extra RAM keep the default.
    fn map_region(&self, _base: usize, _size: usize) -> Result<&'static mut [u8], HalError> {
        Err(HalError::NotSupported)
    }

    // === Trap Return ===

    /// Place the status word of a completed supervisor call in `pid`'s
    /// saved register file, for calls that completed while it was parked.
    fn set_svc_result(&self, pid: u32, code: u32);

    // === Debug ===

    /// Write a debug message to the platform's console
    fn debug_write(&self, msg: &str);

    // === Panic Path ===

    /// Stop the system for inspection (debug builds). Does not return on hardware.
    fn halt(&self);

    /// Full system reset. Does not return on hardware.
    fn reset(&self);
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Address outside any accessible memory
    BadAddress,
    /// Operation not supported on this platform
    NotSupported,
    /// Invalid argument
    InvalidArgument,
    /// Logger was already installed
    AlreadyInitialized,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HalError::BadAddress => f.write_str("bad address"),
            HalError::NotSupported => f.write_str("not supported"),
            HalError::InvalidArgument => f.write_str("invalid argument"),
            HalError::AlreadyInitialized => f.write_str("already initialized"),
        }
    }
}

/// A minimal recording HAL for unit testing
///
/// Keeps a flat simulated RAM starting at `ram_base`, records context
/// switches, timer programming, debug output and panic-path calls.
pub struct TestHal {
    irq_enabled: AtomicBool,
    elapsed: AtomicU32,
    hpet: Mutex<Option<u32>>,
    ram_base: usize,
    ram: Mutex<Vec<u8>>,
    switches: Mutex<Vec<(Option<u32>, u32)>>,
    svc_results: Mutex<Vec<(u32, u32)>>,
    debug_log: Mutex<Vec<String>>,
    halted: AtomicBool,
    resets: AtomicU32,
}

impl TestHal {
    /// Simulated RAM base used by `new`
    pub const DEFAULT_RAM_BASE: usize = 0x2000_0000;
    /// Simulated RAM size used by `new`
    pub const DEFAULT_RAM_SIZE: usize = 64 * 1024;

    pub fn new() -> Self {
        Self::with_ram(Self::DEFAULT_RAM_BASE, Self::DEFAULT_RAM_SIZE)
    }

    pub fn with_ram(base: usize, size: usize) -> Self {
        Self {
            irq_enabled: AtomicBool::new(true),
            elapsed: AtomicU32::new(0),
            hpet: Mutex::new(None),
            ram_base: base,
            ram: Mutex::new(alloc::vec![0u8; size]),
            switches: Mutex::new(Vec::new()),
            svc_results: Mutex::new(Vec::new()),
            debug_log: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
            resets: AtomicU32::new(0),
        }
    }

    /// Set the value reported by `hpet_elapsed`
    pub fn set_elapsed(&self, us: u32) {
        self.elapsed.store(us, Ordering::SeqCst);
    }

    /// Currently armed one-shot interval
    pub fn hpet_armed(&self) -> Option<u32> {
        *self.hpet.lock()
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::SeqCst)
    }

    pub fn switches(&self) -> Vec<(Option<u32>, u32)> {
        self.switches.lock().clone()
    }

    /// Status words delivered on trap return, as `(pid, code)`
    pub fn svc_results(&self) -> Vec<(u32, u32)> {
        self.svc_results.lock().clone()
    }

    pub fn debug_log(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    fn ram_range(&self, addr: usize, len: usize) -> Result<core::ops::Range<usize>, HalError> {
        let start = addr.checked_sub(self.ram_base).ok_or(HalError::BadAddress)?;
        let end = start.checked_add(len).ok_or(HalError::BadAddress)?;
        if end > self.ram.lock().len() {
            return Err(HalError::BadAddress);
        }
        Ok(start..end)
    }
}

impl Default for TestHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HAL for TestHal {
    fn critical_enter(&self) -> IrqState {
        self.irq_enabled.swap(false, Ordering::SeqCst)
    }

    fn critical_exit(&self, state: IrqState) {
        self.irq_enabled.store(state, Ordering::SeqCst);
    }

    fn switch_context(&self, from: Option<u32>, to: u32) {
        self.switches.lock().push((from, to));
    }

    fn hpet_start(&self, us: u32) {
        *self.hpet.lock() = Some(us);
    }

    fn hpet_stop(&self) {
        *self.hpet.lock() = None;
    }

    fn hpet_elapsed(&self) -> u32 {
        self.elapsed.load(Ordering::SeqCst)
    }

    fn copy_from_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), HalError> {
        let range = self.ram_range(addr, buf.len())?;
        buf.copy_from_slice(&self.ram.lock()[range]);
        Ok(())
    }

    fn copy_to_user(&self, addr: usize, data: &[u8]) -> Result<(), HalError> {
        let range = self.ram_range(addr, data.len())?;
        self.ram.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn map_region(&self, base: usize, size: usize) -> Result<&'static mut [u8], HalError> {
        if base == 0 || base.checked_add(size).is_none() {
            return Err(HalError::InvalidArgument);
        }
        // host memory standing in for the board range
        Ok(alloc::boxed::Box::leak(alloc::vec![0u8; size].into_boxed_slice()))
    }

    fn set_svc_result(&self, pid: u32, code: u32) {
        self.svc_results.lock().push((pid, code));
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(String::from(msg));
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_section_restores_state() {
        let hal = TestHal::new();
        let outer = hal.critical_enter();
        assert!(outer);
        assert!(!hal.irq_enabled());

        let inner = hal.critical_enter();
        assert!(!inner);
        hal.critical_exit(inner);
        assert!(!hal.irq_enabled());

        hal.critical_exit(outer);
        assert!(hal.irq_enabled());
    }

    #[test]
    fn test_user_memory_round_trip() {
        let hal = TestHal::with_ram(0x1000, 256);
        hal.copy_to_user(0x1010, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 3];
        hal.copy_from_user(0x1010, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_user_memory_rejects_out_of_range() {
        let hal = TestHal::with_ram(0x1000, 256);
        let mut buf = [0u8; 4];
        assert_eq!(hal.copy_from_user(0x0FFF, &mut buf), Err(HalError::BadAddress));
        assert_eq!(hal.copy_from_user(0x10FE, &mut buf), Err(HalError::BadAddress));
        assert_eq!(hal.copy_to_user(usize::MAX, &[0]), Err(HalError::BadAddress));
    }

    #[test]
    fn test_hpet_programming_is_recorded() {
        let hal = TestHal::new();
        assert_eq!(hal.hpet_armed(), None);
        hal.hpet_start(1500);
        assert_eq!(hal.hpet_armed(), Some(1500));
        hal.hpet_stop();
        assert_eq!(hal.hpet_armed(), None);
    }

    #[test]
    fn test_map_region_validates_range() {
        let hal = TestHal::new();
        let region = hal.map_region(0x2001_0000, 128).unwrap();
        assert_eq!(region.len(), 128);
        assert_eq!(hal.map_region(0, 128).err(), Some(HalError::InvalidArgument));
        assert_eq!(
            hal.map_region(usize::MAX, 2).err(),
            Some(HalError::InvalidArgument)
        );
    }

    #[test]
    fn test_panic_path_is_recorded() {
        let hal = TestHal::new();
        hal.reset();
        hal.reset();
        assert_eq!(hal.reset_count(), 2);
        assert!(!hal.is_halted());
        hal.halt();
        assert!(hal.is_halted());
    }
}
