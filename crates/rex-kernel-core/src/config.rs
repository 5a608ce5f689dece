//! Kernel configuration

use crate::object::OBJECT_COUNT;

/// What the runtime does on a kernel-fatal error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanicPolicy {
    /// Stop for inspection
    Halt,
    /// Full system reset
    Reset,
}

impl Default for PanicPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            PanicPolicy::Halt
        } else {
            PanicPolicy::Reset
        }
    }
}

/// Boot-time kernel parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub panic_policy: PanicPolicy,
    /// Bracket every pool slot with guard words
    pub pool_guards: bool,
    /// Memory of the root process
    pub root_size: usize,
    /// IPC ring capacity of the root process
    pub root_ipc_size: usize,
    /// Upper bound on any process's IPC ring capacity
    pub max_ipc_size: usize,
    /// Reserved object registry indices
    pub object_count: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            panic_policy: PanicPolicy::default(),
            pool_guards: cfg!(feature = "pool-guards"),
            root_size: 1024,
            root_ipc_size: 4,
            max_ipc_size: 64,
            object_count: OBJECT_COUNT,
        }
    }
}

impl KernelConfig {
    pub fn with_panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    pub fn with_pool_guards(mut self, enabled: bool) -> Self {
        self.pool_guards = enabled;
        self
    }

    pub fn with_root_size(mut self, size: usize) -> Self {
        self.root_size = size;
        self
    }

    pub fn with_root_ipc_size(mut self, size: usize) -> Self {
        self.root_ipc_size = size;
        self
    }

    pub fn with_max_ipc_size(mut self, size: usize) -> Self {
        self.max_ipc_size = size;
        self
    }

    pub fn with_object_count(mut self, count: usize) -> Self {
        self.object_count = count;
        self
    }
}
