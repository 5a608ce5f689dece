//! Uptime, the deadline list and soft timers
//!
//! Uptime is the count of 1 Hz pulses plus the hardware elapsed counter,
//! which the runtime latches into the kernel before every entry. One sorted
//! list holds both call timeouts and soft timer expiries. The one-shot
//! hardware timer is only armed for a head due within the current second;
//! later deadlines are picked up by the pulse.

use alloc::collections::VecDeque;
use log::{trace, warn};

use crate::error::KernelError;
use crate::state::Kernel;
use crate::svc::SvcResult;
use crate::types::{ipc_cmd, Effect, IpcMessage, ProcessId, SoftTimerId, SysTime, WaitTarget};

/// Soft timer flag: re-arm with the same interval after each expiry
pub const SOFT_TIMER_PERIODIC: u32 = 1 << 0;

const USEC_PER_SEC: u32 = 1_000_000;

/// Identifies one armed entry in the deadline list
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey(pub u32);

/// What happens when a deadline passes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// A blocking call ran out of time
    ProcessTimeout(ProcessId),
    SoftTimer(SoftTimerId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEntry {
    pub key: TimerKey,
    pub deadline: SysTime,
    pub action: TimerAction,
}

/// Deadlines in ascending order; equal deadlines keep insertion order.
#[derive(Clone, Debug, Default)]
pub struct TimerList {
    entries: VecDeque<TimerEntry>,
    next_key: u32,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deadline: SysTime, action: TimerAction) -> TimerKey {
        let key = TimerKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        let at = self
            .entries
            .iter()
            .position(|e| e.deadline > deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            TimerEntry {
                key,
                deadline,
                action,
            },
        );
        key
    }

    pub fn remove(&mut self, key: TimerKey) -> Option<TimerEntry> {
        let at = self.entries.iter().position(|e| e.key == key)?;
        self.entries.remove(at)
    }

    pub fn head(&self) -> Option<&TimerEntry> {
        self.entries.front()
    }

    /// Dequeue the head if its deadline has passed
    pub fn pop_due(&mut self, now: SysTime) -> Option<TimerEntry> {
        match self.entries.front() {
            Some(e) if e.deadline <= now => self.entries.pop_front(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimerEntry> + '_ {
        self.entries.iter()
    }
}

/// Timer delivering `IPC_TIMEOUT` to its owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftTimer {
    pub owner: ProcessId,
    pub param: u32,
    pub flags: u32,
    pub interval: SysTime,
    pub armed: Option<TimerKey>,
}

impl Kernel {
    // ========================================================================
    // Uptime
    // ========================================================================

    pub fn now(&self) -> SysTime {
        SysTime {
            sec: self.uptime_sec,
            usec: self.elapsed_us,
        }
    }

    /// Latch the hardware elapsed counter
    pub fn set_elapsed(&mut self, us: u32) {
        self.elapsed_us = us.min(USEC_PER_SEC - 1);
    }

    /// 1 Hz tick: advance the second, then run everything now due.
    pub fn on_second_pulse(&mut self) -> Result<usize, KernelError> {
        self.begin_second_pulse();
        let fired = self.run_due_timers()?;
        self.finish_timers();
        Ok(fired)
    }

    /// One-shot hardware timer expiry
    pub fn on_hpet_timeout(&mut self, elapsed_us: u32) -> Result<usize, KernelError> {
        self.begin_hpet_timeout(elapsed_us);
        let fired = self.run_due_timers()?;
        self.finish_timers();
        Ok(fired)
    }

    // The split entry points below let the runtime fire one due entry per
    // critical section: begin, then `pop_due_timer`/`fire_timer` until
    // empty, then `finish_timers` in the same section as the empty pop.

    pub fn begin_second_pulse(&mut self) {
        self.uptime_sec = self.uptime_sec.wrapping_add(1);
        self.elapsed_us = 0;
    }

    pub fn begin_hpet_timeout(&mut self, elapsed_us: u32) {
        self.hpet = None;
        self.set_elapsed(elapsed_us);
    }

    pub fn finish_timers(&mut self) {
        self.reprogram_hpet();
    }

    /// Dequeue one due entry. The runtime interleaves these with
    /// interrupt-enabled windows.
    pub fn pop_due_timer(&mut self) -> Option<TimerEntry> {
        let now = self.now();
        self.timers.pop_due(now)
    }

    pub fn run_due_timers(&mut self) -> Result<usize, KernelError> {
        let mut fired = 0;
        while let Some(entry) = self.pop_due_timer() {
            self.fire_timer(entry)?;
            fired += 1;
        }
        Ok(fired)
    }

    pub fn fire_timer(&mut self, entry: TimerEntry) -> Result<(), KernelError> {
        trace!("timer {:?} fired at {:?}", entry.action, entry.deadline);
        match entry.action {
            TimerAction::ProcessTimeout(pid) => self.expire_wait(pid, entry.key),
            TimerAction::SoftTimer(id) => {
                self.expire_soft_timer(id, entry);
                Ok(())
            }
        }
    }

    fn expire_wait(&mut self, pid: ProcessId, key: TimerKey) -> Result<(), KernelError> {
        let target = match self.processes.get_mut(&pid) {
            Some(p) if p.timeout == Some(key) => {
                p.timeout = None;
                p.waiting
            }
            _ => return Ok(()),
        };
        let Some(target) = target else {
            return Ok(());
        };
        self.unlink_waiter(pid, target);
        let result = match target {
            WaitTarget::Sleep => SvcResult::Ok,
            _ => SvcResult::Err(KernelError::Timeout),
        };
        self.wake_process(pid, result)
    }

    fn expire_soft_timer(&mut self, id: SoftTimerId, entry: TimerEntry) {
        let Some(timer) = self.soft_timers.get(&id) else {
            return;
        };
        if timer.armed != Some(entry.key) {
            return;
        }
        let (owner, param, periodic, interval) = (
            timer.owner,
            timer.param,
            timer.flags & SOFT_TIMER_PERIODIC != 0,
            timer.interval,
        );

        let rearmed = periodic.then(|| {
            self.timers.insert(
                entry.deadline.saturating_add(interval),
                TimerAction::SoftTimer(id),
            )
        });
        if let Some(timer) = self.soft_timers.get_mut(&id) {
            timer.armed = rearmed;
        }

        let msg = IpcMessage::new(ipc_cmd::IPC_TIMEOUT, id.0, param, 0);
        if let Err(e) = self.ipc_post(ProcessId::KERNEL, owner, msg) {
            warn!("soft timer {} lost expiry for process {}: {}", id.0, owner.0, e);
        }
    }

    /// Arm the hardware timer for the head when it falls in this second
    pub(crate) fn reprogram_hpet(&mut self) {
        let now = self.now();
        let wanted = match self.timers.head() {
            Some(e) if e.deadline.sec <= now.sec => Some(e.deadline),
            _ => None,
        };
        if wanted == self.hpet {
            return;
        }
        self.hpet = wanted;
        match wanted {
            Some(deadline) if deadline > now => {
                self.emit(Effect::HpetStart(deadline.usec - now.usec));
            }
            Some(_) => self.emit(Effect::HpetStart(1)),
            None => self.emit(Effect::HpetStop),
        }
    }

    // ========================================================================
    // Soft timers
    // ========================================================================

    pub fn soft_timer_create(&mut self, owner: ProcessId, param: u32, flags: u32) -> Result<SoftTimerId, KernelError> {
        self.process(owner)?;
        let id = SoftTimerId(self.alloc_handle());
        self.soft_timers.insert(
            id,
            SoftTimer {
                owner,
                param,
                flags,
                interval: SysTime::ZERO,
                armed: None,
            },
        );
        Ok(id)
    }

    fn soft_timer_owned(&self, pid: ProcessId, id: SoftTimerId) -> Result<&SoftTimer, KernelError> {
        let timer = self.soft_timers.get(&id).ok_or(KernelError::InvalidMagic)?;
        if timer.owner != pid {
            return Err(KernelError::AccessDenied);
        }
        Ok(timer)
    }

    /// (Re)arm to fire `timeout` from now
    pub fn soft_timer_start(&mut self, pid: ProcessId, id: SoftTimerId, timeout: SysTime) -> Result<(), KernelError> {
        if timeout.is_zero() {
            return Err(KernelError::InvalidParams);
        }
        let armed = self.soft_timer_owned(pid, id)?.armed;
        if let Some(key) = armed {
            self.timers.remove(key);
        }
        let deadline = self.now().saturating_add(timeout);
        let key = self.timers.insert(deadline, TimerAction::SoftTimer(id));
        if let Some(timer) = self.soft_timers.get_mut(&id) {
            timer.interval = timeout;
            timer.armed = Some(key);
        }
        self.reprogram_hpet();
        Ok(())
    }

    pub fn soft_timer_stop(&mut self, pid: ProcessId, id: SoftTimerId) -> Result<(), KernelError> {
        let armed = self.soft_timer_owned(pid, id)?.armed;
        if let Some(key) = armed {
            self.timers.remove(key);
            self.reprogram_hpet();
        }
        if let Some(timer) = self.soft_timers.get_mut(&id) {
            timer.armed = None;
        }
        Ok(())
    }

    pub fn soft_timer_destroy(&mut self, pid: ProcessId, id: SoftTimerId) -> Result<(), KernelError> {
        self.soft_timer_owned(pid, id)?;
        self.soft_timer_remove(id);
        self.reprogram_hpet();
        Ok(())
    }

    pub(crate) fn soft_timer_remove(&mut self, id: SoftTimerId) {
        if let Some(timer) = self.soft_timers.remove(&id) {
            if let Some(key) = timer.armed {
                self.timers.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::*;
    use crate::types::{IpcFilter, Timeout};

    #[test]
    fn test_timer_list_orders_and_keeps_ties_fifo() {
        let mut list = TimerList::new();
        let p = |n| TimerAction::ProcessTimeout(ProcessId(n));
        list.insert(SysTime::from_ms(30), p(1));
        list.insert(SysTime::from_ms(10), p(2));
        list.insert(SysTime::from_ms(30), p(3));
        list.insert(SysTime::from_ms(20), p(4));

        let order: alloc::vec::Vec<_> = list.iter().map(|e| e.action).collect();
        assert_eq!(order, [p(2), p(4), p(1), p(3)]);

        assert!(list.pop_due(SysTime::from_ms(5)).is_none());
        assert_eq!(list.pop_due(SysTime::from_ms(10)).unwrap().action, p(2));
    }

    #[test]
    fn test_hpet_armed_only_within_current_second() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 2);
        let b = spawn(&mut k, "b", 2);
        k.set_elapsed(100_000);
        k.take_effects();

        k.process_sleep(a, Timeout::ms(1500)).unwrap();
        assert!(!k.take_effects().contains(&Effect::HpetStart(400_000)));
        assert_eq!(k.hpet, None);

        k.process_sleep(b, Timeout::ms(300)).unwrap();
        assert!(k.take_effects().contains(&Effect::HpetStart(300_000)));

        assert_eq!(k.on_hpet_timeout(400_000), Ok(1));
        assert_eq!(k.take_resume(b), Some(SvcResult::Ok));
        // the one-shot already expired and the next head is in a later second
        assert!(!k
            .take_effects()
            .iter()
            .any(|e| matches!(e, Effect::HpetStart(_) | Effect::HpetStop)));

        // 1.6 s: due on the second pulse plus 600 ms
        assert_eq!(k.on_second_pulse(), Ok(0));
        assert!(k.take_effects().contains(&Effect::HpetStart(600_000)));
        assert_eq!(k.on_hpet_timeout(600_000), Ok(1));
        assert_eq!(k.take_resume(a), Some(SvcResult::Ok));
    }

    #[test]
    fn test_uptime_combines_pulses_and_elapsed() {
        let mut k = kernel();
        k.on_second_pulse().unwrap();
        k.on_second_pulse().unwrap();
        k.set_elapsed(250);
        assert_eq!(k.now(), SysTime { sec: 2, usec: 250 });
        k.set_elapsed(5_000_000);
        assert_eq!(k.now().usec, 999_999);
    }

    #[test]
    fn test_soft_timer_posts_timeout_message() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 2);
        let t = k.soft_timer_create(a, 0xAB, 0).unwrap();
        k.soft_timer_start(a, t, SysTime::from_ms(10)).unwrap();

        k.on_hpet_timeout(10_000).unwrap();
        let msg = k.ipc_read(a, IpcFilter::ANY).unwrap();
        assert_eq!(msg.cmd, ipc_cmd::IPC_TIMEOUT);
        assert_eq!(msg.param1, t.0);
        assert_eq!(msg.param2, 0xAB);
        assert_eq!(msg.sender, ProcessId::KERNEL);
        assert_eq!(k.soft_timers[&t].armed, None);
    }

    #[test]
    fn test_periodic_soft_timer_rearms() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 2);
        let t = k.soft_timer_create(a, 1, SOFT_TIMER_PERIODIC).unwrap();
        k.soft_timer_start(a, t, SysTime::from_ms(100)).unwrap();

        k.on_hpet_timeout(100_000).unwrap();
        k.on_hpet_timeout(200_000).unwrap();
        assert_eq!(k.process(a).unwrap().ipc.len(), 2);
        assert_eq!(k.timers.head().unwrap().deadline, SysTime::from_ms(300));

        k.soft_timer_stop(a, t).unwrap();
        assert!(k.timers.is_empty());
    }

    #[test]
    fn test_soft_timer_owner_checks() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 2);
        let b = spawn(&mut k, "b", 2);
        let t = k.soft_timer_create(a, 0, 0).unwrap();
        assert_eq!(
            k.soft_timer_start(b, t, SysTime::from_ms(1)),
            Err(KernelError::AccessDenied)
        );
        assert_eq!(
            k.soft_timer_start(a, t, SysTime::ZERO),
            Err(KernelError::InvalidParams)
        );
        k.soft_timer_start(a, t, SysTime::from_ms(1)).unwrap();
        k.process_destroy(a).unwrap();
        assert!(k.timers.is_empty());
        assert!(k.soft_timers.is_empty());
    }
}
