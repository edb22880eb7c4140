//! Event construction shared by the eBPF programs and host-side tests.
//!
//! Everything here is bounded: no loops, no allocation, no locks. Platform
//! access goes through the traits below so the same `capture` body runs in
//! the verifier-constrained program and under std threads.

use crate::{MountNsFilter, MutexEvent, Operation, ProcessInfo};

/// Result of one `capture` call.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Submitted = 0,
    FilteredOut = 1,
    NoSpace = 2,
    Aborted = 3,
}

impl CaptureOutcome {
    pub const COUNT: usize = 4;
    pub const ALL: [CaptureOutcome; Self::COUNT] = [
        CaptureOutcome::Submitted,
        CaptureOutcome::FilteredOut,
        CaptureOutcome::NoSpace,
        CaptureOutcome::Aborted,
    ];

    /// Slot of this outcome in the `STATS` per-CPU array.
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CaptureOutcome::Submitted => "submitted",
            CaptureOutcome::FilteredOut => "filtered",
            CaptureOutcome::NoSpace => "no_space",
            CaptureOutcome::Aborted => "aborted",
        }
    }
}

/// Identity of the currently executing thread.
pub trait TaskContext {
    /// Mount namespace inode of the current task. `None` when the kernel
    /// structures could not be read.
    fn mntns_id(&self) -> Option<u64>;

    /// pid/tid/comm of the current task, stamped with `mntns_id`.
    fn process(&self, mntns_id: u64) -> Option<ProcessInfo>;

    fn monotonic_ns(&self) -> u64;
}

/// A reserved, not yet visible ring slot. Dropping without `submit` or
/// `discard` is not allowed by the kernel ring, so implementors must be
/// consumed explicitly.
pub trait EventSlot {
    fn write(&mut self, event: MutexEvent);
    fn submit(self);
    fn discard(self);
}

/// Multi-producer ring with atomic, non-blocking reservation.
pub trait EventRing {
    type Slot: EventSlot;

    fn reserve(&self) -> Option<Self::Slot>;
}

/// Build and publish one event for `operation` on `mutex_addr`.
///
/// The filter runs before the ring is touched, so filtered calls cost no
/// buffer space. The timestamp is read last, right before commit.
#[inline(always)]
pub fn capture<C, F, R>(
    ctx: &C,
    filter: &F,
    ring: &R,
    operation: Operation,
    mutex_addr: u64,
) -> CaptureOutcome
where
    C: TaskContext,
    F: MountNsFilter,
    R: EventRing,
{
    let Some(mntns_id) = ctx.mntns_id() else {
        return CaptureOutcome::Aborted;
    };

    if filter.should_discard(mntns_id) {
        return CaptureOutcome::FilteredOut;
    }

    let Some(mut slot) = ring.reserve() else {
        return CaptureOutcome::NoSpace;
    };

    let Some(process) = ctx.process(mntns_id) else {
        slot.discard();
        return CaptureOutcome::Aborted;
    };

    let mut event = MutexEvent {
        timestamp: 0,
        process,
        mutex_addr,
        operation: operation as u32,
        _pad: 0,
    };
    event.timestamp = ctx.monotonic_ns();

    slot.write(event);
    slot.submit();
    CaptureOutcome::Submitted
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::TASK_COMM_LEN;
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    struct FakeTask {
        pid: u32,
        mntns: Option<u64>,
        identity_ok: bool,
        clock: Cell<u64>,
    }

    impl FakeTask {
        fn new(pid: u32, mntns: u64) -> Self {
            Self {
                pid,
                mntns: Some(mntns),
                identity_ok: true,
                clock: Cell::new(1_000),
            }
        }
    }

    impl TaskContext for FakeTask {
        fn mntns_id(&self) -> Option<u64> {
            self.mntns
        }

        fn process(&self, mntns_id: u64) -> Option<ProcessInfo> {
            if !self.identity_ok {
                return None;
            }
            let mut comm = [0u8; TASK_COMM_LEN];
            comm[..4].copy_from_slice(b"test");
            Some(ProcessInfo {
                pid: self.pid,
                tid: self.pid + 1,
                mntns_id,
                comm,
            })
        }

        fn monotonic_ns(&self) -> u64 {
            let now = self.clock.get() + 1;
            self.clock.set(now);
            now
        }
    }

    struct DenyList(&'static [u64]);

    impl MountNsFilter for DenyList {
        fn should_discard(&self, mntns_id: u64) -> bool {
            self.0.contains(&mntns_id)
        }
    }

    #[derive(Default)]
    struct VecRing {
        capacity: usize,
        reserved: Cell<usize>,
        committed: RefCell<Vec<MutexEvent>>,
        discarded: Cell<usize>,
    }

    struct VecSlot<'a> {
        ring: &'a VecRing,
        event: Option<MutexEvent>,
    }

    impl EventSlot for VecSlot<'_> {
        fn write(&mut self, event: MutexEvent) {
            self.event = Some(event);
        }

        fn submit(self) {
            if let Some(event) = self.event {
                self.ring.committed.borrow_mut().push(event);
            }
        }

        fn discard(self) {
            self.ring.reserved.set(self.ring.reserved.get() - 1);
            self.ring.discarded.set(self.ring.discarded.get() + 1);
        }
    }

    impl<'a> EventRing for &'a VecRing {
        type Slot = VecSlot<'a>;

        fn reserve(&self) -> Option<Self::Slot> {
            if self.reserved.get() == self.capacity {
                return None;
            }
            self.reserved.set(self.reserved.get() + 1);
            Some(VecSlot {
                ring: self,
                event: None,
            })
        }
    }

    fn ring(capacity: usize) -> VecRing {
        VecRing {
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_lock_then_unlock_same_address() {
        let task = FakeTask::new(100, 5);
        let events = ring(8);
        let filter = DenyList(&[]);

        assert_eq!(
            capture(&task, &filter, &&events, Operation::Lock, 0xAA),
            CaptureOutcome::Submitted
        );
        assert_eq!(
            capture(&task, &filter, &&events, Operation::Unlock, 0xAA),
            CaptureOutcome::Submitted
        );

        let committed = events.committed.borrow();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].operation(), Ok(Operation::Lock));
        assert_eq!(committed[1].operation(), Ok(Operation::Unlock));
        assert!(committed.iter().all(|e| e.mutex_addr == 0xAA));
        assert!(committed.iter().all(|e| e.process.pid == 100));
        assert!(committed[0].timestamp < committed[1].timestamp);
        assert_eq!(&committed[0].process.comm[..4], b"test");
    }

    #[test]
    fn test_denied_namespace_never_reserves() {
        let task = FakeTask::new(200, 7);
        let events = ring(8);

        let outcome = capture(&task, &DenyList(&[7]), &&events, Operation::Lock, 0x1);
        assert_eq!(outcome, CaptureOutcome::FilteredOut);
        assert_eq!(events.reserved.get(), 0);
        assert!(events.committed.borrow().is_empty());
    }

    #[test]
    fn test_full_ring_reports_no_space() {
        let task = FakeTask::new(1, 1);
        let events = ring(1);
        let filter = DenyList(&[]);

        assert_eq!(
            capture(&task, &filter, &&events, Operation::Lock, 0x10),
            CaptureOutcome::Submitted
        );
        assert_eq!(
            capture(&task, &filter, &&events, Operation::Lock, 0x20),
            CaptureOutcome::NoSpace
        );
        assert_eq!(events.committed.borrow().len(), 1);
    }

    #[test]
    fn test_unreadable_namespace_aborts() {
        let mut task = FakeTask::new(1, 1);
        task.mntns = None;
        let events = ring(4);

        let outcome = capture(&task, &DenyList(&[]), &&events, Operation::Unlock, 0x10);
        assert_eq!(outcome, CaptureOutcome::Aborted);
        assert_eq!(events.reserved.get(), 0);
    }

    #[test]
    fn test_identity_failure_discards_slot() {
        let mut task = FakeTask::new(1, 1);
        task.identity_ok = false;
        let events = ring(4);

        let outcome = capture(&task, &DenyList(&[]), &&events, Operation::Lock, 0x10);
        assert_eq!(outcome, CaptureOutcome::Aborted);
        assert_eq!(events.discarded.get(), 1);
        assert_eq!(events.reserved.get(), 0);
        assert!(events.committed.borrow().is_empty());
    }

    #[test]
    fn test_outcome_indices_are_dense() {
        for (i, outcome) in CaptureOutcome::ALL.iter().enumerate() {
            assert_eq!(outcome.index() as usize, i);
        }
    }
}
