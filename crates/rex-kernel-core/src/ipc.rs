//! Per-process IPC message queue
//!
//! Each process owns a bounded ring of `IpcMessage`s sized at creation.
//! Posting never blocks: a full ring rejects the message with `Overflow`
//! and leaves the queue as it was. Receivers take the oldest message that
//! matches their filter; everything else keeps its order.

use alloc::collections::VecDeque;
use log::{trace, warn};

use crate::error::KernelError;
use crate::state::Kernel;
use crate::svc::SvcResult;
use crate::types::{IpcFilter, IpcMessage, ProcessId, Timeout, WaitTarget};

/// Bounded FIFO of messages
#[derive(Clone, Debug)]
pub struct IpcQueue {
    ring: VecDeque<IpcMessage>,
    capacity: usize,
}

impl IpcQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, msg: IpcMessage) -> Result<(), KernelError> {
        if self.ring.len() >= self.capacity {
            return Err(KernelError::Overflow);
        }
        self.ring.push_back(msg);
        Ok(())
    }

    /// Remove the oldest message matching `filter`
    pub fn take(&mut self, filter: &IpcFilter) -> Option<IpcMessage> {
        let at = self.ring.iter().position(|m| filter.matches(m))?;
        self.ring.remove(at)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpcMessage> + '_ {
        self.ring.iter()
    }
}

impl Kernel {
    /// Queue `msg` for `dest`, completing its wait if the filter matches.
    pub fn ipc_post(&mut self, sender: ProcessId, dest: ProcessId, msg: IpcMessage) -> Result<(), KernelError> {
        let msg = IpcMessage { sender, ..msg };
        let target = self.process_mut(dest)?;
        if let Err(e) = target.ipc.push(msg) {
            warn!(
                "ipc overflow: {} -> {} cmd {:#x} dropped",
                sender.0, dest.0, msg.cmd
            );
            return Err(e);
        }
        let delivered = match target.waiting {
            Some(WaitTarget::Ipc(filter)) if filter.matches(&msg) => target.ipc.take(&filter),
            _ => None,
        };
        self.total_ipc_count += 1;
        trace!("ipc {} -> {} cmd {:#x}", sender.0, dest.0, msg.cmd);

        if let Some(m) = delivered {
            self.wake_process(dest, SvcResult::Message(m))?;
        }
        Ok(())
    }

    /// Post from interrupt context
    pub fn ipc_post_isr(&mut self, dest: ProcessId, msg: IpcMessage) -> Result<(), KernelError> {
        self.ipc_post(ProcessId::KERNEL, dest, msg)
    }

    /// Take the oldest matching message or park until one arrives.
    pub fn ipc_wait(
        &mut self,
        pid: ProcessId,
        filter: IpcFilter,
        timeout: Timeout,
    ) -> Result<SvcResult, KernelError> {
        if filter.sender == Some(pid) {
            return Err(KernelError::Deadlock);
        }
        if let Some(msg) = self.process_mut(pid)?.ipc.take(&filter) {
            return Ok(SvcResult::Message(msg));
        }
        self.sleep_process(pid, WaitTarget::Ipc(filter), timeout)?;
        Ok(SvcResult::Blocked)
    }

    /// Post to `dest` and wait for its reply carrying the same cmd and param1.
    pub fn ipc_call(
        &mut self,
        pid: ProcessId,
        dest: ProcessId,
        msg: IpcMessage,
        timeout: Timeout,
    ) -> Result<SvcResult, KernelError> {
        if dest == pid {
            return Err(KernelError::Deadlock);
        }
        self.ipc_post(pid, dest, msg)?;
        let reply = IpcFilter {
            sender: Some(dest),
            cmd: Some(msg.cmd),
            param1: Some(msg.param1),
        };
        self.ipc_wait(pid, reply, timeout)
    }

    /// Non-blocking receive
    pub fn ipc_read(&mut self, pid: ProcessId, filter: IpcFilter) -> Result<IpcMessage, KernelError> {
        self.process_mut(pid)?
            .ipc
            .take(&filter)
            .ok_or(KernelError::NotFound)
    }
}
