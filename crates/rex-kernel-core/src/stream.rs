//! Byte-stream pipe
//!
//! A stream is a bounded byte ring shared through per-process handles.
//! Writers hand bytes straight to parked readers before touching the ring
//! and park with whatever does not fit. Readers drain the ring, then parked
//! writers, then pull writer bytes into the freed ring space. A read that
//! gets at least one byte returns at once; an empty read parks.
//!
//! At most one listener is told (once, by `IPC_STREAM_WRITE`) when the ring
//! goes from empty to non-empty.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, warn};

use crate::error::KernelError;
use crate::state::Kernel;
use crate::svc::SvcResult;
use crate::types::{
    ipc_cmd, IpcMessage, ProcessId, StreamDir, StreamHandle, StreamId, Timeout, WaitTarget,
};

/// Reader parked on an empty stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamReader {
    pub pid: ProcessId,
    pub want: usize,
}

/// Writer parked with bytes the ring could not take
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamWriter {
    pub pid: ProcessId,
    pub pending: VecDeque<u8>,
    /// Bytes of this write already accepted
    pub written: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Listener {
    pub pid: ProcessId,
    pub handle: StreamHandle,
    pub param: u32,
}

#[derive(Clone, Debug)]
pub struct Stream {
    pub ring: VecDeque<u8>,
    pub capacity: usize,
    pub readers: VecDeque<StreamReader>,
    pub writers: VecDeque<StreamWriter>,
    pub listener: Option<Listener>,
}

/// A process's handle onto a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamBinding {
    pub stream: StreamId,
    pub pid: ProcessId,
}

impl Stream {
    fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            listener: None,
        }
    }

    fn free(&self) -> usize {
        self.capacity - self.ring.len()
    }

    /// Move parked writer bytes into free ring space
    fn refill(&mut self, done: &mut Vec<StreamWriter>) {
        loop {
            let free = self.free();
            if free == 0 {
                break;
            }
            let Some(w) = self.writers.front_mut() else {
                break;
            };
            let n = free.min(w.pending.len());
            self.ring.extend(w.pending.drain(..n));
            w.written += n;
            if w.pending.is_empty() {
                if let Some(w) = self.writers.pop_front() {
                    done.push(w);
                }
            }
        }
    }
}

impl Kernel {
    pub fn stream_create(&mut self, size: usize) -> Result<StreamId, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidParams);
        }
        let id = StreamId(self.alloc_handle());
        self.streams.insert(id, Stream::new(size));
        debug!("stream {} created ({} bytes)", id.0, size);
        Ok(id)
    }

    pub fn stream_open(&mut self, pid: ProcessId, stream: StreamId) -> Result<StreamHandle, KernelError> {
        self.process(pid)?;
        if !self.streams.contains_key(&stream) {
            return Err(KernelError::InvalidMagic);
        }
        let handle = StreamHandle(self.alloc_handle());
        self.stream_handles
            .insert(handle, StreamBinding { stream, pid });
        Ok(handle)
    }

    pub fn stream_close(&mut self, pid: ProcessId, handle: StreamHandle) -> Result<(), KernelError> {
        self.stream_resolve(pid, handle)?;
        self.stream_unbind(handle);
        Ok(())
    }

    pub(crate) fn stream_unbind(&mut self, handle: StreamHandle) {
        let Some(binding) = self.stream_handles.remove(&handle) else {
            return;
        };
        if let Some(s) = self.streams.get_mut(&binding.stream) {
            if s.listener.map(|l| l.handle) == Some(handle) {
                s.listener = None;
            }
        }
    }

    fn stream_resolve(&self, pid: ProcessId, handle: StreamHandle) -> Result<StreamId, KernelError> {
        let binding = self
            .stream_handles
            .get(&handle)
            .ok_or(KernelError::InvalidMagic)?;
        if binding.pid != pid {
            return Err(KernelError::AccessDenied);
        }
        Ok(binding.stream)
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut Stream, KernelError> {
        self.streams.get_mut(&id).ok_or(KernelError::InvalidMagic)
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    /// Write all of `data`, parking with the remainder when nothing takes it.
    ///
    /// Completes with the number of bytes written.
    pub fn stream_write(&mut self, pid: ProcessId, handle: StreamHandle, data: &[u8]) -> Result<SvcResult, KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        if data.is_empty() {
            return Ok(SvcResult::Value(0));
        }
        let s = self.stream_mut(id)?;

        let mut off = 0;
        let mut handoffs = Vec::new();
        while off < data.len() {
            let Some(reader) = s.readers.pop_front() else {
                break;
            };
            let n = reader.want.min(data.len() - off);
            handoffs.push((reader.pid, data[off..off + n].to_vec()));
            off += n;
        }

        let was_empty = s.ring.is_empty();
        let n = s.free().min(data.len() - off);
        s.ring.extend(&data[off..off + n]);
        off += n;
        let notify = was_empty && !s.ring.is_empty();

        let parked = off < data.len();
        if parked {
            s.writers.push_back(StreamWriter {
                pid,
                pending: data[off..].iter().copied().collect(),
                written: off,
            });
        }

        for (reader, bytes) in handoffs {
            self.wake_process(reader, SvcResult::Bytes(bytes))?;
        }
        if notify {
            self.stream_notify(id);
        }
        if parked {
            self.sleep_process(pid, WaitTarget::Stream(id, StreamDir::Write), Timeout::Infinite)?;
            return Ok(SvcResult::Blocked);
        }
        Ok(SvcResult::Value(data.len() as u32))
    }

    /// Read up to `size` bytes; parks only when nothing is available.
    pub fn stream_read(&mut self, pid: ProcessId, handle: StreamHandle, size: usize) -> Result<SvcResult, KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        if size == 0 {
            return Ok(SvcResult::Bytes(Vec::new()));
        }
        let s = self.stream_mut(id)?;

        let n = size.min(s.ring.len());
        let mut out: Vec<u8> = s.ring.drain(..n).collect();

        let mut done = Vec::new();
        while out.len() < size {
            let Some(w) = s.writers.front_mut() else {
                break;
            };
            let n = (size - out.len()).min(w.pending.len());
            out.extend(w.pending.drain(..n));
            w.written += n;
            if w.pending.is_empty() {
                if let Some(w) = s.writers.pop_front() {
                    done.push(w);
                }
            }
        }

        let was_empty = s.ring.is_empty();
        s.refill(&mut done);
        let notify = was_empty && !s.ring.is_empty();

        if out.is_empty() {
            s.readers.push_back(StreamReader { pid, want: size });
        }

        for w in done {
            self.wake_process(w.pid, SvcResult::Value(w.written as u32))?;
        }
        if notify {
            self.stream_notify(id);
        }
        if out.is_empty() {
            self.sleep_process(pid, WaitTarget::Stream(id, StreamDir::Read), Timeout::Infinite)?;
            return Ok(SvcResult::Blocked);
        }
        Ok(SvcResult::Bytes(out))
    }

    // ========================================================================
    // Listener
    // ========================================================================

    /// Ask for one `IPC_STREAM_WRITE` when data arrives. Fires at once if
    /// the ring already holds data.
    pub fn stream_listen(&mut self, pid: ProcessId, handle: StreamHandle, param: u32) -> Result<(), KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        let s = self.stream_mut(id)?;
        if let Some(l) = s.listener {
            if l.pid != pid {
                return Err(KernelError::AlreadyConfigured);
            }
        }
        s.listener = Some(Listener { pid, handle, param });
        if !s.ring.is_empty() {
            self.stream_notify(id);
        }
        Ok(())
    }

    pub fn stream_stop_listen(&mut self, pid: ProcessId, handle: StreamHandle) -> Result<(), KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        let s = self.stream_mut(id)?;
        match s.listener {
            Some(l) if l.handle == handle => {
                s.listener = None;
                Ok(())
            }
            _ => Err(KernelError::NotConfigured),
        }
    }

    fn stream_notify(&mut self, id: StreamId) {
        let Some(listener) = self.streams.get_mut(&id).and_then(|s| s.listener.take()) else {
            return;
        };
        let msg = IpcMessage::new(
            ipc_cmd::IPC_STREAM_WRITE,
            listener.handle.0,
            listener.param,
            0,
        );
        if let Err(e) = self.ipc_post(ProcessId::KERNEL, listener.pid, msg) {
            warn!("stream {} listener {} not notified: {}", id.0, listener.pid.0, e);
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Discard buffered bytes and release every waiter with success
    pub fn stream_flush(&mut self, pid: ProcessId, handle: StreamHandle) -> Result<(), KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        let s = self.stream_mut(id)?;
        s.ring.clear();
        let readers: Vec<_> = s.readers.drain(..).collect();
        let writers: Vec<_> = s.writers.drain(..).collect();
        for r in readers {
            self.wake_process(r.pid, SvcResult::Bytes(Vec::new()))?;
        }
        for w in writers {
            self.wake_process(w.pid, SvcResult::Value(w.written as u32))?;
        }
        Ok(())
    }

    /// Bytes buffered in the ring
    pub fn stream_get_size(&self, pid: ProcessId, handle: StreamHandle) -> Result<usize, KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        Ok(self.streams.get(&id).ok_or(KernelError::InvalidMagic)?.ring.len())
    }

    pub fn stream_get_free(&self, pid: ProcessId, handle: StreamHandle) -> Result<usize, KernelError> {
        let id = self.stream_resolve(pid, handle)?;
        Ok(self.streams.get(&id).ok_or(KernelError::InvalidMagic)?.free())
    }

    pub fn stream_destroy(&mut self, id: StreamId) -> Result<(), KernelError> {
        let s = self.streams.remove(&id).ok_or(KernelError::InvalidMagic)?;
        self.stream_handles.retain(|_, b| b.stream != id);
        for r in s.readers {
            self.wake_process(r.pid, SvcResult::Err(KernelError::SyncObjectDestroyed))?;
        }
        for w in s.writers {
            self.wake_process(w.pid, SvcResult::Err(KernelError::SyncObjectDestroyed))?;
        }
        debug!("stream {} destroyed", id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::assert_invariants;
    use crate::state::testing::*;
    use crate::types::{IpcFilter, ProcessState};

    fn setup(size: usize) -> (Kernel, ProcessId, ProcessId, StreamHandle, StreamHandle) {
        let mut k = kernel();
        let reader = spawn(&mut k, "reader", 2);
        let writer = spawn(&mut k, "writer", 3);
        let s = k.stream_create(size).unwrap();
        let rh = k.stream_open(reader, s).unwrap();
        let wh = k.stream_open(writer, s).unwrap();
        (k, reader, writer, rh, wh)
    }

    // ========================================================================
    // Transfer
    // ========================================================================

    #[test]
    fn test_write_fits_in_ring() {
        let (mut k, reader, writer, rh, wh) = setup(8);
        assert_eq!(k.stream_write(writer, wh, b"abc"), Ok(SvcResult::Value(3)));
        assert_eq!(k.stream_get_size(writer, wh), Ok(3));
        assert_eq!(k.stream_get_free(writer, wh), Ok(5));
        assert_eq!(k.stream_read(reader, rh, 10), Ok(SvcResult::Bytes(b"abc".to_vec())));
    }

    #[test]
    fn test_write_hands_off_to_parked_reader() {
        let (mut k, reader, writer, rh, wh) = setup(4);
        assert_eq!(k.stream_read(reader, rh, 5), Ok(SvcResult::Blocked));

        // Scenario: 5 bytes to the reader directly, 3 into the ring
        assert_eq!(k.stream_write(writer, wh, b"12345678"), Ok(SvcResult::Value(8)));
        assert_eq!(k.take_resume(reader), Some(SvcResult::Bytes(b"12345".to_vec())));
        assert_eq!(k.stream_get_size(writer, wh), Ok(3));
        assert_invariants(&k);
    }

    #[test]
    fn test_writer_parks_and_reader_drains_it() {
        let (mut k, reader, writer, rh, wh) = setup(4);
        assert_eq!(k.stream_write(writer, wh, b"abcdefghij"), Ok(SvcResult::Blocked));
        assert_eq!(k.stream_get_size(reader, rh), Ok(4));

        // ring first, then the writer, then the ring refills from the writer
        assert_eq!(k.stream_read(reader, rh, 6), Ok(SvcResult::Bytes(b"abcdef".to_vec())));
        assert_eq!(k.stream_get_size(reader, rh), Ok(4));
        // the refill took the writer's last bytes
        assert_eq!(k.process(writer).unwrap().state, ProcessState::Active);
        assert_eq!(k.take_resume(writer), Some(SvcResult::Value(10)));

        assert_eq!(k.stream_read(reader, rh, 4), Ok(SvcResult::Bytes(b"ghij".to_vec())));
        assert_invariants(&k);
    }

    #[test]
    fn test_bytes_arrive_in_order_exactly_once() {
        let (mut k, reader, writer, rh, wh) = setup(3);
        let payload: Vec<u8> = (0u8..40).collect();
        assert_eq!(k.stream_write(writer, wh, &payload), Ok(SvcResult::Blocked));

        let mut received = Vec::new();
        while received.len() < payload.len() {
            match k.stream_read(reader, rh, 7).unwrap() {
                SvcResult::Bytes(b) => received.extend(b),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, payload);
        assert_eq!(k.take_resume(writer), Some(SvcResult::Value(40)));
    }

    #[test]
    fn test_empty_read_parks_until_data() {
        let (mut k, reader, writer, rh, wh) = setup(4);
        assert_eq!(k.stream_read(reader, rh, 2), Ok(SvcResult::Blocked));
        assert_eq!(k.stream_write(writer, wh, b"z"), Ok(SvcResult::Value(1)));
        assert_eq!(k.take_resume(reader), Some(SvcResult::Bytes(b"z".to_vec())));
    }

    #[test]
    fn test_handles_are_per_process() {
        let (mut k, reader, _writer, _rh, wh) = setup(4);
        assert_eq!(k.stream_write(reader, wh, b"x"), Err(KernelError::AccessDenied));
        assert_eq!(
            k.stream_read(reader, StreamHandle(4242), 1),
            Err(KernelError::InvalidMagic)
        );
    }

    // ========================================================================
    // Listener
    // ========================================================================

    #[test]
    fn test_listener_notified_once_on_empty_to_non_empty() {
        let (mut k, reader, writer, rh, wh) = setup(8);
        k.stream_listen(reader, rh, 0x55).unwrap();

        k.stream_write(writer, wh, b"a").unwrap();
        k.stream_write(writer, wh, b"b").unwrap();
        let note = k.ipc_read(reader, IpcFilter::ANY).unwrap();
        assert_eq!(note.cmd, ipc_cmd::IPC_STREAM_WRITE);
        assert_eq!(note.param1, rh.0);
        assert_eq!(note.param2, 0x55);
        assert_eq!(k.ipc_read(reader, IpcFilter::ANY), Err(KernelError::NotFound));
        assert!(k.streams.values().all(|s| s.listener.is_none()));
    }

    #[test]
    fn test_listen_with_buffered_data_notifies_immediately() {
        let (mut k, reader, writer, rh, wh) = setup(8);
        k.stream_write(writer, wh, b"data").unwrap();
        k.stream_listen(reader, rh, 1).unwrap();
        assert_eq!(k.process(reader).unwrap().ipc.len(), 1);
        assert_eq!(k.stream_stop_listen(reader, rh), Err(KernelError::NotConfigured));
    }

    #[test]
    fn test_second_listener_rejected() {
        let (mut k, reader, writer, rh, wh) = setup(8);
        k.stream_listen(reader, rh, 1).unwrap();
        assert_eq!(k.stream_listen(writer, wh, 2), Err(KernelError::AlreadyConfigured));
        k.stream_close(reader, rh).unwrap();
        k.stream_listen(writer, wh, 2).unwrap();
    }

    // ========================================================================
    // Flush and destroy
    // ========================================================================

    #[test]
    fn test_flush_releases_waiters_with_ok() {
        let (mut k, _reader, writer, _rh, wh) = setup(2);
        assert_eq!(k.stream_write(writer, wh, b"abcdef"), Ok(SvcResult::Blocked));
        let other = spawn(&mut k, "flusher", 4);
        let s = k.stream_handles[&wh].stream;
        let fh = k.stream_open(other, s).unwrap();

        k.stream_flush(other, fh).unwrap();
        assert_eq!(k.take_resume(writer), Some(SvcResult::Value(2)));
        assert_eq!(k.stream_get_size(other, fh), Ok(0));
    }

    #[test]
    fn test_destroy_releases_waiters_with_error() {
        let (mut k, reader, _writer, rh, _wh) = setup(2);
        k.stream_read(reader, rh, 1).unwrap();
        let s = k.stream_handles[&rh].stream;
        k.stream_destroy(s).unwrap();
        assert_eq!(
            k.take_resume(reader),
            Some(SvcResult::Err(KernelError::SyncObjectDestroyed))
        );
        assert!(k.stream_handles.is_empty());
    }
}
