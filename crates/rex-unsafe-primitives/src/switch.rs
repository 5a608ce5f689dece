//! Pend-switch request and interrupt nesting tracker
//!
//! Interrupt handlers run in their own execution context: they may wake
//! processes (which requests a context switch) but the switch itself is only
//! performed on return to thread context. Both the request flag and the
//! nesting depth are touched from ISR and thread context, so they are
//! atomics rather than plain fields behind the critical section.
//!
//! # Invariants
//!
//! 1. **No lost request**: a `request` is observed by exactly one `take`
//! 2. **No switch inside an ISR**: `take_for_thread` never consumes while nested

#[cfg(all(test, feature = "loom"))]
use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(not(all(test, feature = "loom")))]
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Pending context-switch flag plus interrupt nesting depth
pub struct SwitchRequest {
    pending: AtomicBool,
    irq_nesting: AtomicU32,
}

impl SwitchRequest {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            irq_nesting: AtomicU32::new(0),
        }
    }

    /// Ask for a context switch at the next return to thread context
    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consume the pending request, if any
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Consume the pending request only when no interrupt handler is active
    pub fn take_for_thread(&self) -> bool {
        if self.in_interrupt() {
            return false;
        }
        self.take()
    }

    /// Enter an interrupt handler
    pub fn irq_enter(&self) {
        self.irq_nesting.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave an interrupt handler, returning the remaining nesting depth
    pub fn irq_exit(&self) -> u32 {
        let mut current = self.irq_nesting.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.irq_nesting.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_interrupt(&self) -> bool {
        self.irq_nesting.load(Ordering::Acquire) != 0
    }
}

impl Default for SwitchRequest {
    fn default() -> Self {
        Self::new()
    }
}
