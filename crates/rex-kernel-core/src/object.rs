//! System object registry
//!
//! A fixed table of well-known indices (stdout, stdin, the core service...)
//! mapping to kernel handles, so processes can find shared objects without
//! passing handles around at boot.

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::state::Kernel;
use crate::types::{Handle, INVALID_HANDLE};

/// Reserved indices
pub const OBJECT_COUNT: usize = 8;

pub const SYS_OBJ_STDOUT: usize = 0;
pub const SYS_OBJ_STDIN: usize = 1;
pub const SYS_OBJ_CORE: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRegistry {
    slots: Vec<Handle>,
}

impl ObjectRegistry {
    pub fn new(count: usize) -> Self {
        Self {
            slots: alloc::vec![INVALID_HANDLE; count],
        }
    }

    pub fn get(&self, index: usize) -> Result<Handle, KernelError> {
        match self.slots.get(index) {
            None => Err(KernelError::InvalidParams),
            Some(&INVALID_HANDLE) => Err(KernelError::NotConfigured),
            Some(&handle) => Ok(handle),
        }
    }

    pub fn set(&mut self, index: usize, handle: Handle) -> Result<(), KernelError> {
        let slot = self.slots.get_mut(index).ok_or(KernelError::InvalidParams)?;
        *slot = handle;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Kernel {
    pub fn object_get(&self, index: usize) -> Result<Handle, KernelError> {
        self.objects.get(index)
    }

    /// Publish `handle` at `index`; `INVALID_HANDLE` clears the slot
    pub fn object_set(&mut self, index: usize, handle: Handle) -> Result<(), KernelError> {
        self.objects.set(index, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_bounds_and_defaults() {
        let mut reg = ObjectRegistry::new(OBJECT_COUNT);
        assert_eq!(reg.len(), OBJECT_COUNT);
        assert_eq!(reg.get(SYS_OBJ_STDOUT), Err(KernelError::NotConfigured));
        assert_eq!(reg.get(OBJECT_COUNT), Err(KernelError::InvalidParams));

        reg.set(SYS_OBJ_STDOUT, 42).unwrap();
        assert_eq!(reg.get(SYS_OBJ_STDOUT), Ok(42));
        assert_eq!(reg.set(OBJECT_COUNT, 1), Err(KernelError::InvalidParams));

        reg.set(SYS_OBJ_STDOUT, INVALID_HANDLE).unwrap();
        assert_eq!(reg.get(SYS_OBJ_STDOUT), Err(KernelError::NotConfigured));
    }
}
