//! Ownership-transferable buffers
//!
//! A block is a piece of system-pool memory with an immutable owner and a
//! holder (`granted`) that changes as the block is sent around. Only the
//! holder may map it; sending revokes the sender's mapping. The owner may
//! destroy the block at any time, but while someone else holds it the
//! destruction is deferred until the block comes back.

use alloc::vec::Vec;
use log::debug;

use crate::error::KernelError;
use crate::state::Kernel;
use crate::types::{BlockId, ProcessId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Live,
    /// Owner destroyed it while it was lent out
    PendingDestroy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub owner: ProcessId,
    pub granted: ProcessId,
    /// Holder currently has the memory mapped
    pub mapped: bool,
    pub state: BlockState,
    pub addr: usize,
    pub size: usize,
    /// Bytes of payload in use, for IO buffers
    pub data_size: usize,
    pub(crate) pool_index: usize,
}

impl Block {
    fn covers(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.addr && end <= self.addr + self.size,
            None => false,
        }
    }
}

impl Kernel {
    pub fn block_create(&mut self, pid: ProcessId, size: usize) -> Result<BlockId, KernelError> {
        self.process(pid)?;
        if size == 0 {
            return Err(KernelError::InvalidParams);
        }
        let (pool_index, addr) = self.alloc_system(size)?;
        let id = BlockId(self.alloc_handle());
        self.blocks.insert(
            id,
            Block {
                owner: pid,
                granted: pid,
                mapped: false,
                state: BlockState::Live,
                addr,
                size,
                data_size: 0,
                pool_index,
            },
        );
        debug!("block {} created for {} at {:#x} ({} bytes)", id.0, pid.0, addr, size);
        Ok(id)
    }

    /// Block held by `pid`
    fn block_held(&mut self, pid: ProcessId, id: BlockId) -> Result<&mut Block, KernelError> {
        let block = self.blocks.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        if block.granted != pid {
            return Err(KernelError::AccessDenied);
        }
        Ok(block)
    }

    /// Map the block, returning its address
    pub fn block_open(&mut self, pid: ProcessId, id: BlockId) -> Result<usize, KernelError> {
        let block = self.block_held(pid, id)?;
        block.mapped = true;
        Ok(block.addr)
    }

    pub fn block_close(&mut self, pid: ProcessId, id: BlockId) -> Result<(), KernelError> {
        self.block_held(pid, id)?.mapped = false;
        Ok(())
    }

    /// Pass the block to `to`, revoking the sender's mapping
    pub fn block_send(&mut self, pid: ProcessId, id: BlockId, to: ProcessId) -> Result<(), KernelError> {
        let owner = self.blocks.get(&id).ok_or(KernelError::InvalidMagic)?.owner;
        if to != owner {
            self.process(to)?;
        }
        let block = self.block_held(pid, id)?;
        block.mapped = false;
        block.granted = to;
        let finished = to == owner && block.state == BlockState::PendingDestroy;
        if finished {
            self.block_finalize(id)?;
        }
        Ok(())
    }

    pub fn block_send_to_owner(&mut self, pid: ProcessId, id: BlockId) -> Result<(), KernelError> {
        let owner = self.blocks.get(&id).ok_or(KernelError::InvalidMagic)?.owner;
        self.block_send(pid, id, owner)
    }

    /// Destroy now, or once the block returns to its owner
    pub fn block_destroy(&mut self, pid: ProcessId, id: BlockId) -> Result<(), KernelError> {
        let block = self.blocks.get_mut(&id).ok_or(KernelError::InvalidMagic)?;
        if block.owner != pid {
            return Err(KernelError::AccessDenied);
        }
        if block.granted == pid {
            self.block_finalize(id)
        } else {
            block.state = BlockState::PendingDestroy;
            debug!("block {} destroy deferred, held by {}", id.0, block.granted.0);
            Ok(())
        }
    }

    pub fn block_get_size(&self, id: BlockId) -> Result<usize, KernelError> {
        Ok(self.blocks.get(&id).ok_or(KernelError::InvalidMagic)?.size)
    }

    pub fn block_get_data_size(&self, id: BlockId) -> Result<usize, KernelError> {
        Ok(self.blocks.get(&id).ok_or(KernelError::InvalidMagic)?.data_size)
    }

    pub fn block_set_data_size(&mut self, pid: ProcessId, id: BlockId, size: usize) -> Result<(), KernelError> {
        let block = self.block_held(pid, id)?;
        if size > block.size {
            return Err(KernelError::InvalidParams);
        }
        block.data_size = size;
        Ok(())
    }

    fn block_finalize(&mut self, id: BlockId) -> Result<(), KernelError> {
        if let Some(block) = self.blocks.remove(&id) {
            self.free_system(block.pool_index, block.addr)?;
            debug!("block {} destroyed", id.0);
        }
        Ok(())
    }

    /// Whether `pid` holds a mapped block covering the range
    pub(crate) fn block_mapped_for(&self, pid: ProcessId, addr: usize, len: usize) -> bool {
        self.blocks
            .values()
            .any(|b| b.granted == pid && b.mapped && b.covers(addr, len))
    }

    /// Return blocks lent to a dying process and destroy the ones it owns
    pub(crate) fn block_release_process(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        let held: Vec<_> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.granted == pid && b.owner != pid)
            .map(|(id, _)| *id)
            .collect();
        let mut failed = None;
        for id in held {
            if let Err(e) = self.block_send_to_owner(pid, id) {
                failed.get_or_insert(e);
            }
        }

        let owned: Vec<_> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.owner == pid)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            if let Err(e) = self.block_destroy(pid, id) {
                failed.get_or_insert(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }
}
