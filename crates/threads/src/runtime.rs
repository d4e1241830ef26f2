use std::{sync::Arc, thread::JoinHandle, time::Duration};

use crate::{
    error::{ThreadError, WaitResult},
    objectmodel::ObjectRef,
    options::ThreadingOptions,
    sync::{
        monitor_table::{MonitorTable, RawMonitorHandle},
        object_monitor::ObjectSynchronizer,
    },
};

pub mod deadlock;
pub mod park;
pub mod registry;
pub mod suspend;
pub mod threads;

use deadlock::{CycleEdge, DeadlockDetector};
use park::ParkController;
use registry::{current_thread, ThreadCounters, ThreadRegistry};
use suspend::SuspensionController;
use threads::{ThreadId, ThreadInfo, ThreadRecord};

/// What the execution engine provides to the thread core.
pub trait SafepointPollable: Send + Sync + 'static {
    /// Runs on `thread` during every safepoint poll it takes, after any
    /// suspension has been served.
    fn at_safepoint(&self, thread: &ThreadRecord) {
        let _ = thread;
    }

    /// Deliver an interrupt posted with [`ThreadRecord::post_async_interrupt`].
    fn deliver_interrupt(&self, thread: &ThreadRecord) {
        let _ = thread;
    }

    /// The runtime clock in milliseconds since the unix epoch.
    fn current_time_millis(&self) -> u64 {
        crate::utils::epoch_millis()
    }
}

/// Engine with no safepoint work and the system clock.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopRuntime;

impl SafepointPollable for NoopRuntime {}

pub struct ThreadingBuilder {
    options: ThreadingOptions,
    runtime: Option<Arc<dyn SafepointPollable>>,
}

impl ThreadingBuilder {
    pub fn new() -> Self {
        Self {
            options: ThreadingOptions::default(),
            runtime: None,
        }
    }

    /// Use the values of the `--threads:*` flags.
    pub fn from_flags(mut self) -> Self {
        self.options = ThreadingOptions::from_flags();
        self
    }

    pub fn options(mut self, options: ThreadingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn SafepointPollable>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Threading {
        let options = self.options;
        let runtime = self.runtime.unwrap_or_else(|| Arc::new(NoopRuntime));
        let monitors = Arc::new(MonitorTable::new(&options));
        let registry = Arc::new(ThreadRegistry::new(monitors.clone()));

        Threading {
            objects: Arc::new(ObjectSynchronizer::new(
                monitors.clone(),
                registry.clone(),
                &options,
            )),
            suspension: Arc::new(SuspensionController::new(registry.clone(), &options)),
            parking: Arc::new(ParkController::new(registry.clone())),
            detector: Arc::new(DeadlockDetector::new(registry.clone(), monitors.clone())),
            options,
            runtime,
            registry,
            monitors,
        }
    }
}

/// Detaches a spawned thread when its body returns or unwinds.
struct DetachOnExit {
    registry: Arc<ThreadRegistry>,
    thread: Arc<ThreadRecord>,
}

impl Drop for DetachOnExit {
    fn drop(&mut self) {
        // `f` may have detached on its own
        if self.thread.is_alive() {
            self.registry.detach(&self.thread);
        }
    }
}

impl Default for ThreadingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread and monitor management for one runtime instance.
///
/// Operations that act "as the current thread" use the record attached to the
/// calling OS thread and fail with [`ThreadError::InternalError`] when there
/// is none.
#[derive(Clone)]
pub struct Threading {
    options: ThreadingOptions,
    runtime: Arc<dyn SafepointPollable>,
    registry: Arc<ThreadRegistry>,
    monitors: Arc<MonitorTable>,
    objects: Arc<ObjectSynchronizer>,
    suspension: Arc<SuspensionController>,
    parking: Arc<ParkController>,
    detector: Arc<DeadlockDetector>,
}

impl Threading {
    pub fn options(&self) -> &ThreadingOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn monitors(&self) -> &Arc<MonitorTable> {
        &self.monitors
    }

    pub fn objects(&self) -> &Arc<ObjectSynchronizer> {
        &self.objects
    }

    pub fn suspension(&self) -> &Arc<SuspensionController> {
        &self.suspension
    }

    pub fn parking(&self) -> &Arc<ParkController> {
        &self.parking
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    pub fn current(&self) -> Result<Arc<ThreadRecord>, ThreadError> {
        current_thread().ok_or(ThreadError::InternalError("current thread is not attached"))
    }

    pub fn attach_current(
        &self,
        name: &str,
        daemon: bool,
    ) -> Result<Arc<ThreadRecord>, ThreadError> {
        self.registry.attach(name, daemon, self.runtime.clone())
    }

    /// Detach the current thread. Monitors it still holds are released.
    pub fn detach_current(&self) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.registry.detach(&thread);
        Ok(())
    }

    /// Spawn an OS thread attached for the duration of `f`. The thread is
    /// detached even when `f` panics.
    pub fn spawn<F, T>(
        &self,
        name: &str,
        daemon: bool,
        f: F,
    ) -> std::io::Result<JoinHandle<Result<T, ThreadError>>>
    where
        F: FnOnce(&Arc<ThreadRecord>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        let thread_name = name.to_owned();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let thread = this.attach_current(&thread_name, daemon)?;
                let _detach = DetachOnExit {
                    registry: this.registry.clone(),
                    thread: thread.clone(),
                };
                let result = f(&thread);
                Ok(result)
            })
    }

    pub fn join_non_daemon(&self) {
        self.registry.join_non_daemon();
    }

    pub fn monitor_enter(&self, object: &ObjectRef) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.objects.enter(object, &thread)
    }

    pub fn monitor_try_enter(&self, object: &ObjectRef) -> Result<bool, ThreadError> {
        let thread = self.current()?;
        self.objects.try_enter(object, &thread)
    }

    pub fn monitor_exit(&self, object: &ObjectRef) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.objects.exit(object, &thread)
    }

    pub fn monitor_wait(
        &self,
        object: &ObjectRef,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, ThreadError> {
        let thread = self.current()?;
        self.objects.wait(object, &thread, timeout)
    }

    pub fn monitor_notify(&self, object: &ObjectRef) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.objects.notify(object, &thread)
    }

    pub fn monitor_notify_all(&self, object: &ObjectRef) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.objects.notify_all(object, &thread)
    }

    pub fn holds_lock(&self, object: &ObjectRef) -> Result<bool, ThreadError> {
        let thread = self.current()?;
        Ok(self.objects.holds_lock(object, &thread))
    }

    pub fn raw_monitor_create(&self, name: &str) -> Result<RawMonitorHandle, ThreadError> {
        self.monitors.create(name)
    }

    pub fn raw_monitor_destroy(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        self.monitors.destroy(handle)
    }

    pub fn raw_monitor_enter(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.monitors.enter(handle, &thread)
    }

    pub fn raw_monitor_try_enter(&self, handle: RawMonitorHandle) -> Result<bool, ThreadError> {
        let thread = self.current()?;
        self.monitors.try_enter(handle, &thread)
    }

    pub fn raw_monitor_exit(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.monitors.exit(handle, &thread)
    }

    pub fn raw_monitor_wait(
        &self,
        handle: RawMonitorHandle,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, ThreadError> {
        let thread = self.current()?;
        self.monitors.wait(handle, &thread, timeout)
    }

    pub fn raw_monitor_notify(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.monitors.notify(handle, &thread)
    }

    pub fn raw_monitor_notify_all(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        let thread = self.current()?;
        self.monitors.notify_all(handle, &thread)
    }

    pub fn suspend(&self, target: ThreadId) -> Result<(), ThreadError> {
        self.suspension.suspend(target)
    }

    pub fn resume(&self, target: ThreadId) -> Result<(), ThreadError> {
        self.suspension.resume(target)
    }

    pub fn suspend_all(&self, targets: &[ThreadId]) -> Vec<Result<(), ThreadError>> {
        self.suspension.suspend_all(targets)
    }

    pub fn resume_all(&self, targets: &[ThreadId]) -> Vec<Result<(), ThreadError>> {
        self.suspension.resume_all(targets)
    }

    /// Interrupt `target`. Returns `false` when no such thread is attached.
    pub fn interrupt(&self, target: ThreadId) -> bool {
        match self.registry.get(target) {
            Some(thread) => {
                thread.interrupt();
                true
            }
            None => false,
        }
    }

    pub fn is_interrupted(&self, target: ThreadId) -> Option<bool> {
        self.registry.get(target).map(|thread| thread.is_interrupted())
    }

    /// Read and clear the interrupt flag of the current thread.
    pub fn interrupted(&self) -> Result<bool, ThreadError> {
        Ok(self.current()?.interrupted())
    }

    pub fn park(&self, timeout: Option<Duration>) -> Result<WaitResult, ThreadError> {
        let thread = self.current()?;
        Ok(self.parking.park(&thread, timeout))
    }

    pub fn park_until(&self, deadline_millis: u64) -> Result<WaitResult, ThreadError> {
        let thread = self.current()?;
        Ok(self.parking.park_until(&thread, deadline_millis))
    }

    pub fn unpark(&self, target: ThreadId) {
        self.parking.unpark(target);
    }

    pub fn sleep(&self, duration: Duration) -> Result<WaitResult, ThreadError> {
        let thread = self.current()?;
        Ok(self.parking.sleep(&thread, duration))
    }

    pub fn set_priority(&self, target: ThreadId, priority: i32) -> bool {
        match self.registry.get(target) {
            Some(thread) => {
                thread.set_priority(priority);
                true
            }
            None => false,
        }
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.registry
            .threads()
            .iter()
            .map(|thread| thread.id())
            .collect()
    }

    pub fn thread_info(&self, target: ThreadId) -> Option<ThreadInfo> {
        self.registry.get(target).map(|thread| thread.info())
    }

    pub fn all_thread_info(&self) -> Vec<ThreadInfo> {
        self.registry
            .threads()
            .iter()
            .map(|thread| thread.info())
            .collect()
    }

    pub fn counters(&self) -> ThreadCounters {
        self.registry.counters()
    }

    pub fn find_deadlocked(&self, threads: &[ThreadId]) -> Vec<ThreadId> {
        self.detector.find_deadlocked(threads)
    }

    pub fn find_cycles(&self, threads: &[ThreadId]) -> Vec<Vec<CycleEdge>> {
        self.detector.find_cycles(threads)
    }

    pub fn find_all_deadlocked(&self) -> Vec<ThreadId> {
        self.detector.find_all_deadlocked()
    }
}
