//! Fixed physical memory regions
//!
//! Pools and process memory live in fixed RAM ranges described by the board
//! (linker symbols, datasheet addresses). This module is the single place
//! where such a range becomes a Rust slice.
//!
//! # Safety Invariants
//!
//! 1. **Exclusive**: the region is handed out once and never aliased
//! 2. **Word aligned**: pool slot headers are 32-bit words
//! 3. **No wrap**: `base + size` does not overflow the address space

/// Alignment required of a region base
pub const REGION_ALIGN: usize = 4;

/// Reasons a raw region is rejected before it becomes a slice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// Base address is null
    Null,
    /// Base address is not word aligned
    Misaligned,
    /// `base + size` wraps the address space
    Overflow,
}

/// Build a `'static` byte slice over a fixed memory region.
///
/// # Safety
///
/// The caller must guarantee that `[base, base + size)` is valid, writable
/// RAM for the rest of the program, that nothing else (stack, `.data`,
/// another region, DMA) uses it, and that this function is called at most
/// once for any byte of it.
pub unsafe fn region_from_raw(base: usize, size: usize) -> Result<&'static mut [u8], RegionError> {
    if base == 0 {
        return Err(RegionError::Null);
    }
    if base % REGION_ALIGN != 0 {
        return Err(RegionError::Misaligned);
    }
    if base.checked_add(size).is_none() {
        return Err(RegionError::Overflow);
    }
    // SAFETY: bounds checked above, exclusivity and validity are the
    // caller's contract.
    Ok(unsafe { core::slice::from_raw_parts_mut(base as *mut u8, size) })
}

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: rejected regions never reach `from_raw_parts_mut`
    #[kani::proof]
    fn rejects_wrapping_regions() {
        let base: usize = kani::any();
        let size: usize = kani::any();
        kani::assume(base != 0 && base % REGION_ALIGN == 0);
        kani::assume(base.checked_add(size).is_none());

        let result = unsafe { region_from_raw(base, size) };
        kani::assert(result == Err(RegionError::Overflow), "wrapping region must be rejected");
    }
}
