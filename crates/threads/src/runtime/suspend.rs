//! Cooperative suspension.
//!
//! A suspension request bumps the target's suspend count under the
//! [`SuspendGuard`] and asks the target to take a yieldpoint. The target stops
//! at its next [`safepoint_poll`](ThreadRecord::safepoint_poll), or immediately
//! counts as stopped when it sits in a native region: it cannot return to
//! managed code without passing through `check_block`.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    error::{fatal, ThreadError},
    options::ThreadingOptions,
    runtime::{
        registry::{current_thread, ThreadRegistry},
        threads::{ExecStatus, ThreadId, ThreadRecord},
    },
    utils::yield_now,
};

/// Proof that the suspend lock is held. Suspend counts only change through
/// methods that take one.
pub struct SuspendGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

pub struct SuspensionController {
    lock: ReentrantMutex<()>,
    registry: Arc<ThreadRegistry>,
    poll_interval: usize,
}

impl SuspensionController {
    pub fn new(registry: Arc<ThreadRegistry>, options: &ThreadingOptions) -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            registry,
            poll_interval: options.suspend_poll_interval.max(1),
        }
    }

    /// Take the suspend lock. An attached caller acquires it inside a native
    /// region, so it can itself be suspended while waiting for the lock.
    pub fn lock(&self) -> SuspendGuard<'_> {
        let Some(current) = current_thread() else {
            return SuspendGuard {
                _guard: self.lock.lock(),
            };
        };

        if current.in_native() {
            return SuspendGuard {
                _guard: self.lock.lock(),
            };
        }

        loop {
            current.enter_native();
            let guard = self.lock.lock();
            if current.attempt_leave_native_no_block() {
                return SuspendGuard { _guard: guard };
            }

            drop(guard);
            current.check_block();
        }
    }

    /// Suspend `target`. Returns once the target stopped (or, for the caller
    /// itself, once it was resumed). Unknown and already suspended targets
    /// are a no-op.
    pub fn suspend(&self, target: ThreadId) -> Result<(), ThreadError> {
        let guard = self.lock();
        let Some(thread) = self.registry.get(target) else {
            return Ok(());
        };

        if thread.suspend_count() > 0 {
            return Ok(());
        }

        let current = current_thread();
        let is_self = current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &thread));

        thread.set_suspend_count(1, &guard);
        log::debug!(target: "vmkit::threads", "suspending thread {}", target);

        if is_self {
            drop(guard);
            thread.check_block();
            return Ok(());
        }

        self.stop_other(&thread, current.as_deref(), &guard);
        Ok(())
    }

    fn stop_other(
        &self,
        thread: &ThreadRecord,
        current: Option<&ThreadRecord>,
        guard: &SuspendGuard<'_>,
    ) {
        if thread.request_block(guard) != ExecStatus::InManagedToBlock {
            return;
        }

        loop {
            if thread.has_acknowledged_suspend()
                || !thread.is_alive()
                || thread.exec_status() == ExecStatus::Terminated
            {
                break;
            }

            for _ in 0..self.poll_interval {
                yield_now();
            }

            if let Some(current) = current {
                current.safepoint_poll();
            }
        }
    }

    /// Resume `target`. Resuming a thread that is not suspended is a no-op.
    pub fn resume(&self, target: ThreadId) -> Result<(), ThreadError> {
        let guard = self.lock();
        if let Some(thread) = self.registry.get(target) {
            self.resume_locked(&thread, &guard);
        }
        Ok(())
    }

    fn resume_locked(&self, thread: &ThreadRecord, guard: &SuspendGuard<'_>) {
        match thread.suspend_count() {
            0 => {}
            1 => {
                thread.set_suspend_count(0, guard);
                thread.unblock(guard);
                log::debug!(target: "vmkit::threads", "resumed thread {}", thread.id());
            }
            n => fatal!("suspend count of thread {} is corrupted: {}", thread.id(), n),
        }
    }

    /// Suspend every thread in `targets`. The caller, if listed, is suspended
    /// last and after the lock is released.
    pub fn suspend_all(&self, targets: &[ThreadId]) -> Vec<Result<(), ThreadError>> {
        let current = current_thread();
        let mut suspend_self = None;
        let guard = self.lock();

        let results = targets
            .iter()
            .map(|&target| {
                let Some(thread) = self.registry.get(target) else {
                    return Ok(());
                };

                if thread.suspend_count() > 0 {
                    return Ok(());
                }

                if current
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &thread))
                {
                    suspend_self = Some(thread);
                    return Ok(());
                }

                thread.set_suspend_count(1, &guard);
                self.stop_other(&thread, current.as_deref(), &guard);
                Ok(())
            })
            .collect::<Vec<_>>();

        if let Some(thread) = suspend_self {
            thread.set_suspend_count(1, &guard);
            drop(guard);
            thread.check_block();
        } else {
            drop(guard);
        }

        log::debug!(target: "vmkit::threads", "suspended {} thread(s)", targets.len());
        results
    }

    pub fn resume_all(&self, targets: &[ThreadId]) -> Vec<Result<(), ThreadError>> {
        let guard = self.lock();
        targets
            .iter()
            .map(|&target| {
                if let Some(thread) = self.registry.get(target) {
                    self.resume_locked(&thread, &guard);
                }
                Ok(())
            })
            .collect()
    }
}
