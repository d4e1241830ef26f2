//! Per-thread park permit and sleep.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::WaitResult,
    runtime::{
        registry::ThreadRegistry,
        threads::{StateBits, ThreadId, ThreadRecord},
    },
};

/// Blocking primitive owned by every thread record. Unpark, interrupt and
/// sleep all go through the same mutex and condition variable.
pub struct Parker {
    permit: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn has_permit(&self) -> bool {
        *self.permit.lock()
    }

    fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cv.notify_all();
    }

    /// Wake the owner without granting a permit.
    pub(crate) fn wake(&self) {
        let _permit = self.permit.lock();
        self.cv.notify_all();
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    // an unrepresentable deadline waits forever
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Park/unpark on top of the per-thread [`Parker`].
pub struct ParkController {
    registry: Arc<ThreadRegistry>,
}

impl ParkController {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self { registry }
    }

    /// Block `thread` (the caller) until its permit is available, it is
    /// interrupted or `timeout` elapses. The permit is left unavailable and
    /// the interrupt flag is not cleared.
    pub fn park(&self, thread: &ThreadRecord, timeout: Option<Duration>) -> WaitResult {
        let timed_out_at_start = timeout == Some(Duration::ZERO);
        self.park_inner(thread, deadline_after(timeout), timed_out_at_start)
    }

    /// Like [`park`](Self::park) with an absolute deadline in epoch milliseconds
    /// of the runtime clock.
    pub fn park_until(&self, thread: &ThreadRecord, deadline_millis: u64) -> WaitResult {
        let now = thread.runtime().current_time_millis();
        if deadline_millis <= now {
            return self.park_inner(thread, None, true);
        }

        let remaining = Duration::from_millis(deadline_millis - now);
        self.park_inner(thread, deadline_after(Some(remaining)), false)
    }

    fn park_inner(
        &self,
        thread: &ThreadRecord,
        deadline: Option<Instant>,
        expired: bool,
    ) -> WaitResult {
        let parker = &thread.parker;
        let mut permit = thread.lock_with_handshake(&parker.permit);

        if *permit {
            *permit = false;
            return WaitResult::Woken;
        }

        if thread.is_interrupted() {
            return WaitResult::Interrupted;
        }

        if expired {
            return WaitResult::TimedOut;
        }

        thread.set_activity(StateBits::PARKED);

        let result = loop {
            if *permit {
                break WaitResult::Woken;
            }

            if thread.is_interrupted() {
                break WaitResult::Interrupted;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break WaitResult::TimedOut;
            }

            thread.wait_with_handshake(&parker.cv, &mut permit, deadline);
        };

        *permit = false;
        drop(permit);
        thread.set_activity(StateBits::RUNNABLE);
        result
    }

    /// Make the permit of `target` available and wake it. A missing target is
    /// ignored. Permits do not accumulate.
    pub fn unpark(&self, target: ThreadId) {
        if let Some(thread) = self.registry.get(target) {
            thread.parker.unpark();
        }
    }

    /// Sleep for `duration` without touching the permit. Returns
    /// [`WaitResult::TimedOut`] once the full duration elapsed and
    /// [`WaitResult::Interrupted`] (clearing the flag) when interrupted.
    pub fn sleep(&self, thread: &ThreadRecord, duration: Duration) -> WaitResult {
        if thread.interrupted() {
            return WaitResult::Interrupted;
        }

        let deadline = deadline_after(Some(duration));
        let parker = &thread.parker;
        let mut guard = thread.lock_with_handshake(&parker.permit);
        thread.set_activity(StateBits::SLEEPING);

        let result = loop {
            if thread.interrupted() {
                break WaitResult::Interrupted;
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break WaitResult::TimedOut;
            }

            thread.wait_with_handshake(&parker.cv, &mut guard, deadline);
        };

        drop(guard);
        thread.set_activity(StateBits::RUNNABLE);
        result
    }
}
