//! Fault injection for driver calls.
//!
//! Tests arm a failure for a specific driver operation; the next call of
//! that operation consumes it and reports the armed status instead of
//! running.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::status::HostStatus;

/// Driver operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    /// `current_context`.
    CurrentContext,
    /// `set_current_context`.
    SetCurrentContext,
    /// `stream_create`.
    StreamCreate,
    /// `stream_synchronize`.
    StreamSynchronize,
    /// `stream_wait_event`.
    StreamWaitEvent,
    /// `event_create`.
    EventCreate,
    /// `event_record`.
    EventRecord,
    /// `event_query`.
    EventQuery,
    /// `event_synchronize`.
    EventSynchronize,
    /// `event_destroy`.
    EventDestroy,
    /// `launch_host_fn`.
    LaunchHostFn,
    /// `mem_alloc`.
    MemAlloc,
    /// `memcpy_htod_async` and `memcpy_dtoh`.
    Memcpy,
}

/// Armed failures, consumed in arming order per operation.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashMap<HostOp, VecDeque<FaultSlot>>>,
}

#[derive(Debug)]
struct FaultSlot {
    /// Calls to let through before failing.
    skip: usize,
    status: HostStatus,
}

impl FaultInjector {
    /// Makes the next call of `op` fail with `status`.
    pub fn fail_next(&self, op: HostOp, status: HostStatus) {
        self.fail_nth(op, 0, status);
    }

    /// Lets `skip` calls of `op` through, then fails the following one.
    pub fn fail_nth(&self, op: HostOp, skip: usize, status: HostStatus) {
        self.armed
            .lock()
            .entry(op)
            .or_default()
            .push_back(FaultSlot { skip, status });
    }

    /// Disarms every pending failure.
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// Number of armed failures for `op`.
    #[must_use]
    pub fn pending(&self, op: HostOp) -> usize {
        self.armed.lock().get(&op).map_or(0, VecDeque::len)
    }

    /// Consumes an armed failure for `op`, if one is due.
    pub(crate) fn check(&self, op: HostOp) -> Result<(), HostStatus> {
        let mut armed = self.armed.lock();
        let Some(queue) = armed.get_mut(&op) else {
            return Ok(());
        };
        let Some(slot) = queue.front_mut() else {
            return Ok(());
        };
        if slot.skip > 0 {
            slot.skip -= 1;
            return Ok(());
        }
        let status = slot.status;
        queue.pop_front();
        tracing::debug!(?op, %status, "Injected fault");
        Err(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_next_is_consumed_once() {
        let faults = FaultInjector::default();
        faults.fail_next(HostOp::EventCreate, HostStatus::OutOfMemory);

        assert_eq!(faults.check(HostOp::EventRecord), Ok(()));
        assert_eq!(
            faults.check(HostOp::EventCreate),
            Err(HostStatus::OutOfMemory)
        );
        assert_eq!(faults.check(HostOp::EventCreate), Ok(()));
    }

    #[test]
    fn test_fail_nth_skips_calls() {
        let faults = FaultInjector::default();
        faults.fail_nth(HostOp::StreamCreate, 2, HostStatus::OutOfResources);

        assert_eq!(faults.check(HostOp::StreamCreate), Ok(()));
        assert_eq!(faults.check(HostOp::StreamCreate), Ok(()));
        assert_eq!(
            faults.check(HostOp::StreamCreate),
            Err(HostStatus::OutOfResources)
        );
        assert_eq!(faults.pending(HostOp::StreamCreate), 0);
    }

    #[test]
    fn test_clear() {
        let faults = FaultInjector::default();
        faults.fail_next(HostOp::MemAlloc, HostStatus::OutOfMemory);
        faults.clear();
        assert_eq!(faults.check(HostOp::MemAlloc), Ok(()));
    }
}
