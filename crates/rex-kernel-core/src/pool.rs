//! Variable-size pool allocator over a fixed byte region
//!
//! Metadata lives inside the region as little-endian `u32` words, so the same
//! code runs over a host `Vec<u8>` and a `&'static mut [u8]` mapped onto RAM.
//!
//! ```text
//! slot:  | next | magic | next_free | [head guard] | payload ... | [tail guard] |
//!        ^ offset s                                                ^ next
//! ```
//!
//! Slots form one address-ordered chain from offset 0 to `top`. A slot is
//! free iff it is linked into the free list, which is also address-ordered.
//! The region past `top` is unused and the last slot grows into it, bounded
//! by an exclusion boundary supplied per call (a process's stack pointer for
//! private pools, the region end for system pools). A free slot never ends
//! at `top`: it is returned to the unused region instead.

use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Metadata word size; payloads are multiples of it
pub const WORD: usize = 4;

/// Smallest payload a slot can carry
pub const MIN_PAYLOAD: usize = WORD;

const H_NEXT: usize = 0;
const H_MAGIC: usize = 4;
const H_NEXT_FREE: usize = 8;
const BASE_HEADER: usize = 12;

const MAGIC_USED: u32 = 0x5553_4544;
const MAGIC_FREE: u32 = 0x4652_4545;
const GUARD_HEAD: u32 = 0xDEAD_BEEF;
const GUARD_TAIL: u32 = 0xBAAD_F00D;
const NIL: u32 = u32::MAX;

/// Pool errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// No free slot fits and the region cannot grow past the boundary
    OutOfMemory,
    /// Region base or length is unusable
    InvalidSize,
    /// Metadata at this address failed validation
    Corrupted(usize),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory => f.write_str("pool out of memory"),
            PoolError::InvalidSize => f.write_str("invalid pool region"),
            PoolError::Corrupted(addr) => write!(f, "pool corrupted at {:#x}", addr),
        }
    }
}

/// Pool accounting. `used + free + overhead == total` covers the grown
/// span, and `total + unused == capacity` covers the whole region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Bytes of region available to the pool
    pub capacity: usize,
    /// Bytes currently covered by slots
    pub total: usize,
    /// Region tail the pool has not grown into yet
    pub unused: usize,
    pub used: usize,
    pub free: usize,
    pub overhead: usize,
    pub used_slots: usize,
    pub free_slots: usize,
    pub largest_free: usize,
}

/// Backing storage for a pool
pub enum Region {
    /// Heap-backed, used for private process pools and host builds
    Owned(Vec<u8>),
    /// RAM handed over at boot or through pool registration
    Fixed(&'static mut [u8]),
}

impl Region {
    pub fn zeroed(size: usize) -> Self {
        Region::Owned(alloc::vec![0u8; size])
    }
}

impl AsRef<[u8]> for Region {
    fn as_ref(&self) -> &[u8] {
        match self {
            Region::Owned(v) => v,
            Region::Fixed(s) => s,
        }
    }
}

impl AsMut<[u8]> for Region {
    fn as_mut(&mut self) -> &mut [u8] {
        match self {
            Region::Owned(v) => v,
            Region::Fixed(s) => s,
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Owned(v) => write!(f, "Region::Owned({} bytes)", v.len()),
            Region::Fixed(s) => write!(f, "Region::Fixed({} bytes)", s.len()),
        }
    }
}

/// Allocator over one region starting at absolute address `base`
pub struct Pool<M> {
    base: usize,
    capacity: usize,
    mem: M,
    guarded: bool,
    top: usize,
    free_head: Option<usize>,
}

impl<M: AsRef<[u8]> + AsMut<[u8]>> Pool<M> {
    pub fn new(base: usize, mem: M, guarded: bool) -> Result<Self, PoolError> {
        if base % WORD != 0 {
            return Err(PoolError::InvalidSize);
        }
        let capacity = mem.as_ref().len() & !(WORD - 1);
        if base.checked_add(capacity).is_none() {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            base,
            capacity,
            mem,
            guarded,
            top: 0,
            free_head: None,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last byte of the region
    pub fn end(&self) -> usize {
        self.base + self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_guarded(&self) -> bool {
        self.guarded
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn header(&self) -> usize {
        if self.guarded {
            BASE_HEADER + WORD
        } else {
            BASE_HEADER
        }
    }

    /// Metadata bytes per slot
    pub fn overhead(&self) -> usize {
        if self.guarded {
            self.header() + WORD
        } else {
            self.header()
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// First-fit allocation, growing the region up to `boundary` (absolute).
    ///
    /// Returns the absolute payload address.
    pub fn allocate(&mut self, size: usize, boundary: usize) -> Result<usize, PoolError> {
        let size = Self::round(size)?;

        let mut prev = None;
        let mut cur = self.free_head;
        while let Some(s) = cur {
            let next = self.check_slot(s, MAGIC_FREE)?;
            let following = self.next_free(s)?;
            if next - s - self.overhead() >= size {
                self.claim(prev, s, next, following, size);
                return Ok(self.payload_addr(s));
            }
            prev = Some(s);
            cur = following;
        }

        let s = self.top;
        let end = s
            .checked_add(self.overhead() + size)
            .ok_or(PoolError::OutOfMemory)?;
        if end > self.limit(boundary) {
            return Err(PoolError::OutOfMemory);
        }
        self.write_slot(s, end, MAGIC_USED, None);
        self.top = end;
        Ok(self.payload_addr(s))
    }

    /// Release a slot returned by `allocate` or `realloc`
    pub fn free(&mut self, addr: usize) -> Result<(), PoolError> {
        let s = self.slot_of(addr)?;
        self.check_slot(s, MAGIC_USED)?;
        self.release(s)
    }

    /// Resize a slot, in place when possible, else allocate, copy and free.
    pub fn realloc(&mut self, addr: usize, size: usize, boundary: usize) -> Result<usize, PoolError> {
        let s = self.slot_of(addr)?;
        let next = self.check_slot(s, MAGIC_USED)?;
        let size = Self::round(size)?;
        let span = next - s - self.overhead();

        if size <= span {
            self.shrink(s, next, size)?;
            return Ok(addr);
        }

        let wanted_end = s
            .checked_add(self.overhead() + size)
            .ok_or(PoolError::OutOfMemory)?;

        // absorb the following free slot
        if self.is_free_slot(next) {
            let next_end = self.check_slot(next, MAGIC_FREE)?;
            if next_end >= wanted_end {
                self.unlink_free(next)?;
                self.write_slot(s, next_end, MAGIC_USED, None);
                self.shrink(s, next_end, size)?;
                return Ok(addr);
            }
        }

        // grow into the unused region
        if next == self.top && wanted_end <= self.limit(boundary) {
            self.write_slot(s, wanted_end, MAGIC_USED, None);
            self.top = wanted_end;
            return Ok(addr);
        }

        let moved = self.allocate(size, boundary)?;
        let src = addr - self.base;
        let dst = moved - self.base;
        self.mem.as_mut().copy_within(src..src + span, dst);
        self.free(addr)?;
        Ok(moved)
    }

    /// Payload capacity of an allocated slot
    pub fn usable_size(&self, addr: usize) -> Result<usize, PoolError> {
        let s = self.slot_of(addr)?;
        let next = self.check_slot(s, MAGIC_USED)?;
        Ok(next - s - self.overhead())
    }

    /// Payload bytes of an allocated slot
    pub fn payload(&self, addr: usize) -> Result<&[u8], PoolError> {
        let len = self.usable_size(addr)?;
        let start = addr - self.base;
        Ok(&self.mem.as_ref()[start..start + len])
    }

    pub fn payload_mut(&mut self, addr: usize) -> Result<&mut [u8], PoolError> {
        let len = self.usable_size(addr)?;
        let start = addr - self.base;
        Ok(&mut self.mem.as_mut()[start..start + len])
    }

    /// Accounting snapshot; zeroed counters when the pool fails `check`
    pub fn stats(&self) -> PoolStats {
        self.check().unwrap_or(PoolStats {
            capacity: self.capacity,
            ..PoolStats::default()
        })
    }

    /// Walk every slot, validating the chain, magics, guards and the free list.
    pub fn check(&self) -> Result<PoolStats, PoolError> {
        let mut stats = PoolStats {
            capacity: self.capacity,
            total: self.top,
            unused: self.capacity - self.top,
            ..PoolStats::default()
        };
        let overhead = self.overhead();
        let mut expected_free = self.free_head;
        let mut s = 0;
        while s < self.top {
            let magic = self.slot_magic(s)?;
            if magic != MAGIC_USED && magic != MAGIC_FREE {
                return Err(PoolError::Corrupted(self.base + s));
            }
            let next = self.check_slot(s, magic)?;
            let span = next - s - overhead;
            stats.overhead += overhead;
            if magic == MAGIC_FREE {
                if expected_free != Some(s) {
                    return Err(PoolError::Corrupted(self.base + s));
                }
                expected_free = self.next_free(s)?;
                stats.free += span;
                stats.free_slots += 1;
                stats.largest_free = stats.largest_free.max(span);
            } else {
                stats.used += span;
                stats.used_slots += 1;
            }
            s = next;
        }
        if let Some(stray) = expected_free {
            return Err(PoolError::Corrupted(self.base + stray));
        }
        Ok(stats)
    }

    // ========================================================================
    // Slot manipulation
    // ========================================================================

    fn round(size: usize) -> Result<usize, PoolError> {
        let rounded = size
            .checked_add(WORD - 1)
            .ok_or(PoolError::OutOfMemory)?
            & !(WORD - 1);
        Ok(rounded.max(MIN_PAYLOAD))
    }

    fn limit(&self, boundary: usize) -> usize {
        boundary.saturating_sub(self.base).min(self.capacity) & !(WORD - 1)
    }

    fn payload_addr(&self, s: usize) -> usize {
        self.base + s + self.header()
    }

    fn slot_of(&self, addr: usize) -> Result<usize, PoolError> {
        let s = addr
            .checked_sub(self.base + self.header())
            .ok_or(PoolError::Corrupted(addr))?;
        if s % WORD != 0 || s >= self.top {
            return Err(PoolError::Corrupted(addr));
        }
        Ok(s)
    }

    /// Take a free slot, splitting off the residual when it can hold a slot
    fn claim(
        &mut self,
        prev: Option<usize>,
        s: usize,
        next: usize,
        following: Option<usize>,
        size: usize,
    ) {
        let rest = next - s - self.overhead() - size;
        let successor = if rest >= self.overhead() + MIN_PAYLOAD {
            let split = s + self.overhead() + size;
            self.write_slot(split, next, MAGIC_FREE, following);
            self.write_slot(s, split, MAGIC_USED, None);
            Some(split)
        } else {
            self.write_slot(s, next, MAGIC_USED, None);
            following
        };
        self.link(prev, successor);
    }

    /// Return a used slot to the free list, merging with free neighbours
    fn release(&mut self, s: usize) -> Result<(), PoolError> {
        let next = self.slot_next(s)?;

        let mut before_prev = None;
        let mut prev = None;
        let mut cur = self.free_head;
        while let Some(f) = cur {
            if f >= s {
                break;
            }
            if self.check_slot(f, MAGIC_FREE)? > s {
                return Err(PoolError::Corrupted(self.base + f));
            }
            before_prev = prev;
            prev = Some(f);
            cur = self.next_free(f)?;
        }
        match cur {
            Some(f) if f == s => return Err(PoolError::Corrupted(self.base + s)),
            Some(f) if f < next => return Err(PoolError::Corrupted(self.base + f)),
            _ => {}
        }

        let (end, following) = if cur == Some(next) {
            (self.check_slot(next, MAGIC_FREE)?, self.next_free(next)?)
        } else {
            (next, cur)
        };

        let (start, link_from) = match prev {
            Some(p) if self.slot_next(p)? == s => (p, before_prev),
            _ => (s, prev),
        };

        if end == self.top {
            self.top = start;
            self.link(link_from, None);
        } else {
            self.write_slot(start, end, MAGIC_FREE, following);
            self.link(link_from, Some(start));
        }
        Ok(())
    }

    /// Split the tail of a used slot off when it can hold a slot
    fn shrink(&mut self, s: usize, next: usize, size: usize) -> Result<(), PoolError> {
        let span = next - s - self.overhead();
        if span - size >= self.overhead() + MIN_PAYLOAD {
            let split = s + self.overhead() + size;
            self.write_slot(s, split, MAGIC_USED, None);
            self.write_slot(split, next, MAGIC_USED, None);
            self.release(split)?;
        }
        Ok(())
    }

    fn unlink_free(&mut self, target: usize) -> Result<(), PoolError> {
        let mut prev = None;
        let mut cur = self.free_head;
        while let Some(f) = cur {
            if f == target {
                let following = self.next_free(f)?;
                self.link(prev, following);
                return Ok(());
            }
            if f > target {
                break;
            }
            prev = Some(f);
            cur = self.next_free(f)?;
        }
        Err(PoolError::Corrupted(self.base + target))
    }

    fn link(&mut self, prev: Option<usize>, target: Option<usize>) {
        match prev {
            Some(p) => self.set_word(p + H_NEXT_FREE, encode(target)),
            None => self.free_head = target,
        }
    }

    fn write_slot(&mut self, s: usize, next: usize, magic: u32, next_free: Option<usize>) {
        self.set_word(s + H_NEXT, next as u32);
        self.set_word(s + H_MAGIC, magic);
        self.set_word(s + H_NEXT_FREE, encode(next_free));
        if self.guarded {
            self.set_word(s + BASE_HEADER, GUARD_HEAD);
            self.set_word(next - WORD, GUARD_TAIL);
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn slot_magic(&self, s: usize) -> Result<u32, PoolError> {
        if s % WORD != 0 || s + self.overhead() + MIN_PAYLOAD > self.top {
            return Err(PoolError::Corrupted(self.base + s));
        }
        Ok(self.word(s + H_MAGIC))
    }

    fn is_free_slot(&self, s: usize) -> bool {
        s < self.top && matches!(self.slot_magic(s), Ok(MAGIC_FREE))
    }

    fn slot_next(&self, s: usize) -> Result<usize, PoolError> {
        let next = self.word(s + H_NEXT) as usize;
        if next % WORD != 0 || next > self.top || next < s + self.overhead() + MIN_PAYLOAD {
            return Err(PoolError::Corrupted(self.base + s));
        }
        Ok(next)
    }

    /// Validate a slot header and guards, returning the chain successor
    fn check_slot(&self, s: usize, magic: u32) -> Result<usize, PoolError> {
        if self.slot_magic(s)? != magic {
            return Err(PoolError::Corrupted(self.base + s));
        }
        let next = self.slot_next(s)?;
        if self.guarded
            && (self.word(s + BASE_HEADER) != GUARD_HEAD || self.word(next - WORD) != GUARD_TAIL)
        {
            return Err(PoolError::Corrupted(self.base + s));
        }
        Ok(next)
    }

    fn next_free(&self, s: usize) -> Result<Option<usize>, PoolError> {
        match self.word(s + H_NEXT_FREE) {
            NIL => Ok(None),
            w => {
                let f = w as usize;
                if f <= s || f >= self.top || f % WORD != 0 {
                    Err(PoolError::Corrupted(self.base + s))
                } else {
                    Ok(Some(f))
                }
            }
        }
    }

    fn word(&self, off: usize) -> u32 {
        let mut bytes = [0u8; WORD];
        bytes.copy_from_slice(&self.mem.as_ref()[off..off + WORD]);
        u32::from_le_bytes(bytes)
    }

    fn set_word(&mut self, off: usize, value: u32) {
        self.mem.as_mut()[off..off + WORD].copy_from_slice(&value.to_le_bytes());
    }

    #[cfg(test)]
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        self.mem.as_mut()
    }
}

fn encode(offset: Option<usize>) -> u32 {
    offset.map_or(NIL, |o| o as u32)
}

impl<M> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("top", &self.top)
            .field("guarded", &self.guarded)
            .finish()
    }
}

// ============================================================================
// Kani proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    #[kani::proof]
    #[kani::unwind(6)]
    fn alloc_free_restores_accounting() {
        let mut pool = Pool::new(0, [0u8; 96], kani::any()).unwrap();
        let a: usize = kani::any();
        let b: usize = kani::any();
        kani::assume(a <= 24 && b <= 24);

        let before = pool.check().unwrap();
        if let Ok(pa) = pool.allocate(a, usize::MAX) {
            if let Ok(pb) = pool.allocate(b, usize::MAX) {
                pool.free(pa).unwrap();
                pool.free(pb).unwrap();
            } else {
                pool.free(pa).unwrap();
            }
        }
        let after = pool.check().unwrap();
        assert_eq!(before, after);
    }
}
