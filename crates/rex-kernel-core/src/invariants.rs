//! Runtime-checkable kernel invariants
//!
//! Used by unit tests after every interesting transition, and by the Kani
//! harnesses below.
//!
//! # Invariants
//!
//! 1. **Ready list**: sorted by priority; holds exactly the Active processes,
//!    each at its current effective priority
//! 2. **Priority inheritance**: a process's current priority is the best of
//!    its base priority and the priorities of waiters on mutexes it owns
//! 3. **Mutex ownership**: owners and `owned_mutexes` agree; a waiter never
//!    owns the mutex it waits for
//! 4. **Wait consistency**: a process sits in a waiter queue iff it is
//!    parked on that object
//! 5. **Timer ordering**: deadlines are non-decreasing and every process
//!    timeout belongs to a parked process
//! 6. **Stream consistency**: the ring respects its capacity; readers only
//!    park on an empty ring, writers only when no reader is parked
//! 7. **Pool accounting**: every system pool and process heap passes `check`

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::state::Kernel;
use crate::timer::TimerAction;
use crate::types::{ProcessId, ProcessState, StreamDir, WaitTarget};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_ready_list(kernel));
    violations.extend(check_priority_inheritance(kernel));
    violations.extend(check_mutex_ownership(kernel));
    violations.extend(check_wait_consistency(kernel));
    violations.extend(check_timer_ordering(kernel));
    violations.extend(check_streams(kernel));
    violations.extend(check_pools(kernel));

    violations
}

/// Invariant 1
fn check_ready_list(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let entries: Vec<_> = kernel.ready.iter().collect();
    for pair in entries.windows(2) {
        if pair[1].1.is_more_important(pair[0].1) {
            violations.push(violation(
                "ready_list",
                format!("process {} ahead of more important {}", pair[0].0 .0, pair[1].0 .0),
            ));
        }
    }

    for (pid, priority) in &entries {
        match kernel.processes.get(pid) {
            None => violations.push(violation(
                "ready_list",
                format!("ready entry for missing process {}", pid.0),
            )),
            Some(p) if p.state != ProcessState::Active => violations.push(violation(
                "ready_list",
                format!("process {} is {:?} but on the ready list", pid.0, p.state),
            )),
            Some(p) if p.current_priority != *priority => violations.push(violation(
                "ready_list",
                format!(
                    "process {} listed at {} but runs at {}",
                    pid.0, priority.0, p.current_priority.0
                ),
            )),
            Some(_) => {}
        }
    }

    for (pid, p) in &kernel.processes {
        if p.state == ProcessState::Active && !kernel.ready.contains(*pid) {
            violations.push(violation(
                "ready_list",
                format!("active process {} missing from the ready list", pid.0),
            ));
        }
    }

    violations
}

/// Invariant 2
fn check_priority_inheritance(kernel: &Kernel) -> Vec<InvariantViolation> {
    kernel
        .processes
        .iter()
        .filter_map(|(pid, p)| {
            let effective = kernel.effective_priority(*pid)?;
            (effective != p.current_priority).then(|| {
                violation(
                    "priority_inheritance",
                    format!(
                        "process {} runs at {} but its effective priority is {}",
                        pid.0, p.current_priority.0, effective.0
                    ),
                )
            })
        })
        .collect()
}

/// Invariant 3
fn check_mutex_ownership(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, m) in &kernel.mutexes {
        match m.owner {
            Some(owner) => {
                let listed = kernel
                    .processes
                    .get(&owner)
                    .is_some_and(|p| p.owned_mutexes.contains(id));
                if !listed {
                    violations.push(violation(
                        "mutex_ownership",
                        format!("mutex {} owner {} does not list it", id.0, owner.0),
                    ));
                }
                if m.waiters.contains(owner) {
                    violations.push(violation(
                        "mutex_ownership",
                        format!("process {} waits on mutex {} it owns", owner.0, id.0),
                    ));
                }
            }
            None if !m.waiters.is_empty() => violations.push(violation(
                "mutex_ownership",
                format!("mutex {} is free but has waiters", id.0),
            )),
            None => {}
        }
    }

    for (pid, p) in &kernel.processes {
        for id in &p.owned_mutexes {
            if kernel.mutexes.get(id).and_then(|m| m.owner) != Some(*pid) {
                violations.push(violation(
                    "mutex_ownership",
                    format!("process {} lists mutex {} it does not own", pid.0, id.0),
                ));
            }
        }
    }

    violations
}

/// Invariant 4
fn check_wait_consistency(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let mut queued: Vec<(ProcessId, WaitTarget)> = Vec::new();
    for (id, m) in &kernel.mutexes {
        queued.extend(m.waiters.iter().map(|pid| (pid, WaitTarget::Mutex(*id))));
    }
    for (id, e) in &kernel.events {
        queued.extend(e.waiters.iter().map(|pid| (pid, WaitTarget::Event(*id))));
    }
    for (id, s) in &kernel.semaphores {
        queued.extend(s.waiters.iter().map(|pid| (pid, WaitTarget::Semaphore(*id))));
    }
    for (id, s) in &kernel.streams {
        queued.extend(s.readers.iter().map(|r| (r.pid, WaitTarget::Stream(*id, StreamDir::Read))));
        queued.extend(s.writers.iter().map(|w| (w.pid, WaitTarget::Stream(*id, StreamDir::Write))));
    }

    for (pid, target) in &queued {
        let parked = kernel
            .processes
            .get(pid)
            .is_some_and(|p| p.state.is_waiting() && p.waiting == Some(*target));
        if !parked {
            violations.push(violation(
                "wait_consistency",
                format!("process {} queued on {:?} but not parked there", pid.0, target),
            ));
        }
    }

    for (pid, p) in &kernel.processes {
        if p.state.is_waiting() != p.waiting.is_some() {
            violations.push(violation(
                "wait_consistency",
                format!("process {} is {:?} with wait target {:?}", pid.0, p.state, p.waiting),
            ));
        }
        let Some(target) = p.waiting else {
            continue;
        };
        let needs_queue = !matches!(target, WaitTarget::Sleep | WaitTarget::Ipc(_));
        if needs_queue && !queued.contains(&(*pid, target)) {
            violations.push(violation(
                "wait_consistency",
                format!("process {} parked on {:?} but not queued", pid.0, target),
            ));
        }
    }

    violations
}

/// Invariant 5
fn check_timer_ordering(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    let entries: Vec<_> = kernel.timers.iter().collect();
    for pair in entries.windows(2) {
        if pair[1].deadline < pair[0].deadline {
            violations.push(violation(
                "timer_ordering",
                format!("deadline {:?} queued after {:?}", pair[1].deadline, pair[0].deadline),
            ));
        }
    }

    for entry in &entries {
        if let TimerAction::ProcessTimeout(pid) = entry.action {
            let owned = kernel
                .processes
                .get(&pid)
                .is_some_and(|p| p.state.is_waiting() && p.timeout == Some(entry.key));
            if !owned {
                violations.push(violation(
                    "timer_ordering",
                    format!("timeout {:?} for process {} that is not parked on it", entry.key, pid.0),
                ));
            }
        }
    }

    violations
}

/// Invariant 6
fn check_streams(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, s) in &kernel.streams {
        if s.ring.len() > s.capacity {
            violations.push(violation(
                "stream_consistency",
                format!("stream {} holds {} of {} bytes", id.0, s.ring.len(), s.capacity),
            ));
        }
        if !s.readers.is_empty() && !s.ring.is_empty() {
            violations.push(violation(
                "stream_consistency",
                format!("stream {} has parked readers and buffered data", id.0),
            ));
        }
        if !s.readers.is_empty() && !s.writers.is_empty() {
            violations.push(violation(
                "stream_consistency",
                format!("stream {} has parked readers and writers", id.0),
            ));
        }
    }

    violations
}

/// Invariant 7
fn check_pools(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (i, pool) in kernel.pools.iter().enumerate() {
        if let Err(e) = pool.check() {
            violations.push(violation("pool_accounting", format!("system pool {}: {}", i, e)));
        }
    }
    for (pid, p) in &kernel.processes {
        if let Err(e) = p.heap.check() {
            violations.push(violation(
                "pool_accounting",
                format!("process {} pool: {}", pid.0, e),
            ));
        }
    }

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(kernel: &Kernel) {
    if let Some(v) = check_all_invariants(kernel).first() {
        panic!("Invariant violated: {}: {}", v.invariant, v.description);
    }
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::config::KernelConfig;
    use crate::pool::Region;
    use crate::types::{Priority, RexDescriptor, Timeout};

    fn small_kernel() -> Kernel {
        let config = KernelConfig::default().with_root_size(64);
        match Kernel::new(config, 0x1000, Region::zeroed(512)) {
            Ok(k) => k,
            Err(_) => kani::assume(false),
        }
    }

    #[kani::proof]
    #[kani::unwind(6)]
    fn create_maintains_invariants() {
        let mut k = small_kernel();
        let prio: u8 = kani::any();
        let _ = k.process_create(&RexDescriptor::new("p", 64, Priority(prio)));
        kani::assert(check_all_invariants(&k).is_empty(), "invariants after create");
    }

    #[kani::proof]
    #[kani::unwind(6)]
    fn sleep_wake_maintains_invariants() {
        let mut k = small_kernel();
        let Ok(pid) = k.process_create(&RexDescriptor::new("p", 64, Priority(kani::any()))) else {
            return;
        };
        let _ = k.process_sleep(pid, Timeout::Infinite);
        let _ = k.process_wakeup(pid);
        kani::assert(check_all_invariants(&k).is_empty(), "invariants after sleep/wake");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::*;
    use crate::types::{Priority, Timeout};

    // ========================================================================
    // Valid states
    // ========================================================================

    #[test]
    fn test_invariants_hold_for_new_kernel() {
        let k = kernel();
        assert!(check_all_invariants(&k).is_empty());
    }

    #[test]
    fn test_invariants_hold_through_contention() {
        let mut k = kernel();
        let low = spawn(&mut k, "low", 9);
        let high = spawn(&mut k, "high", 1);
        let m = k.mutex_create();
        k.mutex_lock(low, m, Timeout::Infinite).unwrap();
        k.mutex_lock(high, m, Timeout::ms(10)).unwrap();
        assert_invariants(&k);

        k.on_hpet_timeout(10_000).unwrap();
        assert_invariants(&k);
    }

    // ========================================================================
    // Detection
    // ========================================================================

    #[test]
    fn test_detects_stale_priority() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 4);
        k.processes.get_mut(&a).unwrap().current_priority = Priority(1);

        let names: Vec<_> = check_all_invariants(&k).iter().map(|v| v.invariant).collect();
        assert!(names.contains(&"ready_list"));
        assert!(names.contains(&"priority_inheritance"));
    }

    #[test]
    fn test_detects_orphan_waiter() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 4);
        let e = k.event_create();
        k.events.get_mut(&e).unwrap().waiters.push(a);

        let v = check_all_invariants(&k);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].invariant, "wait_consistency");
    }

    #[test]
    fn test_detects_unlisted_mutex_owner() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 4);
        let m = k.mutex_create();
        k.mutexes.get_mut(&m).unwrap().owner = Some(a);

        let v = check_all_invariants(&k);
        assert!(v.iter().any(|v| v.invariant == "mutex_ownership"));
    }

    #[test]
    fn test_detects_corrupted_heap() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 4);
        let p = k.process_malloc(a, 8).unwrap();
        let heap = &mut k.processes.get_mut(&a).unwrap().heap;
        // slot magic is the second header word
        let header = if heap.is_guarded() { 16 } else { 12 };
        let off = p - heap.base() - header + 4;
        heap.raw_mut()[off..off + 4].copy_from_slice(&[0; 4]);

        let v = check_all_invariants(&k);
        assert!(v.iter().any(|v| v.invariant == "pool_accounting"));
    }

    #[test]
    #[should_panic(expected = "Invariant violated")]
    fn test_assert_invariants_panics_on_violation() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 4);
        k.ready.remove(a);
        assert_invariants(&k);
    }
}
