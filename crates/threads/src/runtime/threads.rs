use std::{
    fmt,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::{
    error::fatal,
    runtime::{park::Parker, registry::IdPool, suspend::SuspendGuard, SafepointPollable},
    sync::{HeavyMonitor, MonitorRef},
    utils::NativeHandle,
};

/// Identity of a registered thread. Zero is reserved for "no thread".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn from_u64(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Observable thread state.
    ///
    /// At most one bit of [`StateBits::ACTIVITY`] is set at a time, except that
    /// the waiting bits combine (`WAITING | WAITING_TIMED | IN_OBJECT_WAIT`).
    /// `SUSPENDED`, `INTERRUPTED` and `IN_NATIVE` overlay any activity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateBits: u32 {
        const ALIVE = 1 << 0;
        const RUNNABLE = 1 << 1;
        const BLOCKED_ON_ENTER = 1 << 2;
        const WAITING = 1 << 3;
        const WAITING_TIMED = 1 << 4;
        const WAITING_INDEFINITE = 1 << 5;
        const SLEEPING = 1 << 6;
        const IN_OBJECT_WAIT = 1 << 7;
        const PARKED = 1 << 8;
        const INTERRUPTED = 1 << 9;
        const IN_NATIVE = 1 << 10;
        const TERMINATED = 1 << 11;
        const SUSPENDED = 1 << 12;
    }
}

impl StateBits {
    pub const ACTIVITY: Self = Self::RUNNABLE
        .union(Self::BLOCKED_ON_ENTER)
        .union(Self::WAITING)
        .union(Self::WAITING_TIMED)
        .union(Self::WAITING_INDEFINITE)
        .union(Self::SLEEPING)
        .union(Self::IN_OBJECT_WAIT)
        .union(Self::PARKED)
        .union(Self::TERMINATED);

    pub fn is_waiting(&self) -> bool {
        self.contains(Self::WAITING)
    }
}

/// Where a thread executes, from the point of view of the suspension protocol.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ExecStatus {
    New = 0,
    /// Running code that polls safepoints.
    InManaged = 1,
    /// Running code that does not poll (native code or a blocking call).
    InNative = 2,
    /// In managed code, asked to stop at its next safepoint poll.
    InManagedToBlock = 3,
    /// In native code, must block before returning to managed code.
    BlockedInNative = 4,
    Terminated = 5,
}

impl From<u8> for ExecStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::InManaged,
            2 => Self::InNative,
            3 => Self::InManagedToBlock,
            4 => Self::BlockedInNative,
            5 => Self::Terminated,
            _ => fatal!("invalid exec status {}", value),
        }
    }
}

#[derive(Default)]
struct ThreadStats {
    blocked_count: u64,
    blocked_time: Duration,
    blocked_since: Option<Instant>,
    waited_count: u64,
    waited_time: Duration,
    waited_since: Option<Instant>,
}

/// Point-in-time snapshot of a thread for introspection.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: StateBits,
    pub priority: i32,
    pub daemon: bool,
    pub suspend_count: u32,
    pub interrupted: bool,
    pub contended_monitor: Option<MonitorRef>,
    pub wait_monitor: Option<MonitorRef>,
    pub owned_monitors: Vec<MonitorRef>,
    pub blocked_count: u64,
    pub blocked_time: Duration,
    pub waited_count: u64,
    pub waited_time: Duration,
    pub cpu_time: Option<Duration>,
}

/// Per-thread state shared between the thread itself and everyone who
/// suspends, interrupts, unparks or inspects it.
///
/// Most methods may be called from any thread. The ones documented as
/// "current thread only" drive the suspension protocol and must run on the
/// thread the record belongs to.
pub struct ThreadRecord {
    id: ThreadId,
    name: String,
    daemon: bool,
    priority: AtomicI32,
    state: AtomicU32,
    exec: AtomicU8,
    native: NativeHandle,

    suspend_count: AtomicU32,
    /// The thread acknowledged a block request and will not run managed code.
    is_blocked: AtomicBool,
    take_yieldpoint: AtomicBool,
    yieldpoints_disabled: AtomicU32,
    yieldpoint_request_pending: AtomicBool,
    pending_async_interrupt: AtomicBool,
    pub(crate) detached: AtomicBool,
    pub(crate) index_in_registry: AtomicUsize,

    monitor: Mutex<()>,
    monitor_cv: Condvar,

    interrupted: AtomicBool,
    pub(crate) parker: Parker,
    blocker: Mutex<Option<Arc<HeavyMonitor>>>,

    owned: Mutex<SmallVec<[MonitorRef; 8]>>,
    contended: Mutex<Option<MonitorRef>>,
    waiting_on: Mutex<Option<MonitorRef>>,
    stats: Mutex<ThreadStats>,

    runtime: Arc<dyn SafepointPollable>,
    ids: Arc<IdPool>,
}

impl ThreadRecord {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        daemon: bool,
        runtime: Arc<dyn SafepointPollable>,
        ids: Arc<IdPool>,
    ) -> Self {
        Self {
            id,
            name,
            daemon,
            priority: AtomicI32::new(5),
            state: AtomicU32::new((StateBits::ALIVE | StateBits::RUNNABLE).bits()),
            exec: AtomicU8::new(ExecStatus::InManaged as u8),
            native: NativeHandle::current(),
            suspend_count: AtomicU32::new(0),
            is_blocked: AtomicBool::new(false),
            take_yieldpoint: AtomicBool::new(false),
            yieldpoints_disabled: AtomicU32::new(0),
            yieldpoint_request_pending: AtomicBool::new(false),
            pending_async_interrupt: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            index_in_registry: AtomicUsize::new(usize::MAX),
            monitor: Mutex::new(()),
            monitor_cv: Condvar::new(),
            interrupted: AtomicBool::new(false),
            parker: Parker::new(),
            blocker: Mutex::new(None),
            owned: Mutex::new(SmallVec::new()),
            contended: Mutex::new(None),
            waiting_on: Mutex::new(None),
            stats: Mutex::new(ThreadStats::default()),
            runtime,
            ids,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn runtime(&self) -> &Arc<dyn SafepointPollable> {
        &self.runtime
    }

    pub fn is_alive(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
    }

    /// State bits including the overlays computed from other fields.
    pub fn state(&self) -> StateBits {
        let mut bits = StateBits::from_bits_truncate(self.state.load(Ordering::Acquire));
        if self.is_interrupted() {
            bits |= StateBits::INTERRUPTED;
        }
        if self.in_native() {
            bits |= StateBits::IN_NATIVE;
        }
        bits
    }

    /// Replace the activity bits, keeping `ALIVE` and `SUSPENDED`.
    pub(crate) fn set_activity(&self, activity: StateBits) {
        let activity = activity & StateBits::ACTIVITY;
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            let new = (old & !StateBits::ACTIVITY.bits()) | activity.bits();
            match self.state.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }

    fn set_overlay(&self, bits: StateBits, value: bool) {
        if value {
            self.state.fetch_or(bits.bits(), Ordering::AcqRel);
        } else {
            self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn mark_terminated(&self) {
        self.set_activity(StateBits::TERMINATED);
        self.set_overlay(StateBits::ALIVE, false);
        self.set_exec_status(ExecStatus::Terminated);

        // requesters spinning on an acknowledgement look at the exec status
        let _guard = self.monitor.lock();
        self.monitor_cv.notify_all();
    }

    pub fn exec_status(&self) -> ExecStatus {
        ExecStatus::from(self.exec.load(Ordering::Acquire))
    }

    fn set_exec_status(&self, status: ExecStatus) {
        self.exec.store(status as u8, Ordering::Release);
    }

    fn attempt_fast_exec_status_transition(&self, old: ExecStatus, new: ExecStatus) -> bool {
        self.exec
            .compare_exchange_weak(old as u8, new as u8, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Move a running thread to its "must block" variant and return the new status.
    fn set_blocked_exec_status(&self) -> ExecStatus {
        loop {
            let old = self.exec_status();
            let new = match old {
                ExecStatus::InManaged => ExecStatus::InManagedToBlock,
                ExecStatus::InNative => ExecStatus::BlockedInNative,
                other => other,
            };

            if old == new || self.attempt_fast_exec_status_transition(old, new) {
                break new;
            }
        }
    }

    pub fn in_native(&self) -> bool {
        matches!(
            self.exec_status(),
            ExecStatus::InNative | ExecStatus::BlockedInNative
        )
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    /// The thread stopped at a safepoint or sits in a native region while a
    /// suspension is pending.
    pub fn has_acknowledged_suspend(&self) -> bool {
        self.is_blocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspend_count(&self, count: u32, _guard: &SuspendGuard<'_>) {
        self.suspend_count.store(count, Ordering::Release);
        self.set_overlay(StateBits::SUSPENDED, count > 0);
    }

    /// Post a suspension to another thread. Returns the status the thread was
    /// moved to. The suspend count must already be set.
    pub(crate) fn request_block(&self, _guard: &SuspendGuard<'_>) -> ExecStatus {
        let _monitor = self.monitor.lock();
        if self.detached.load(Ordering::Acquire) {
            return ExecStatus::Terminated;
        }

        self.take_yieldpoint.store(true, Ordering::Release);
        let status = self.set_blocked_exec_status();
        if status == ExecStatus::BlockedInNative {
            // the thread cannot return to managed code without passing
            // check_block, so it is stopped as far as we are concerned
            self.is_blocked.store(true, Ordering::Release);
        }
        self.monitor_cv.notify_all();
        status
    }

    /// Wake a thread blocked in [`check_block`](Self::check_block). The suspend
    /// count must already be zero.
    pub(crate) fn unblock(&self, _guard: &SuspendGuard<'_>) {
        let _monitor = self.monitor.lock();
        self.is_blocked.store(false, Ordering::Release);
        self.monitor_cv.notify_all();
    }

    /// Block while a suspension is pending. Current thread only.
    pub(crate) fn check_block(&self) {
        let mut guard = self.monitor.lock();
        while self.suspend_count.load(Ordering::Acquire) > 0 {
            self.is_blocked.store(true, Ordering::Release);
            log::trace!(target: "vmkit::threads", "thread {} blocked at safepoint", self.id);
            self.monitor_cv.wait(&mut guard);
        }
        self.is_blocked.store(false, Ordering::Release);
        self.set_exec_status(ExecStatus::InManaged);
    }

    /// Announce that the thread runs code without safepoint polls. Current thread only.
    pub fn enter_native(&self) {
        loop {
            let old = self.exec_status();
            if old != ExecStatus::InManaged {
                self.enter_native_blocked();
                return;
            }

            if self.attempt_fast_exec_status_transition(old, ExecStatus::InNative) {
                return;
            }
        }
    }

    fn enter_native_blocked(&self) {
        let _guard = self.monitor.lock();
        self.set_exec_status(ExecStatus::BlockedInNative);
        if self.suspend_count.load(Ordering::Acquire) > 0 {
            self.is_blocked.store(true, Ordering::Release);
            self.monitor_cv.notify_all();
        }
    }

    pub(crate) fn attempt_leave_native_no_block(&self) -> bool {
        loop {
            let old = self.exec_status();
            if old != ExecStatus::InNative {
                return false;
            }

            if self.attempt_fast_exec_status_transition(old, ExecStatus::InManaged) {
                return true;
            }
        }
    }

    /// Return to managed code, blocking first if a suspension is pending.
    /// Current thread only.
    pub fn leave_native(&self) {
        if !self.attempt_leave_native_no_block() {
            self.check_block();
        }
    }

    /// Acquire `mutex` without stalling a suspension of this thread. Current thread only.
    pub(crate) fn lock_with_handshake<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        if self.in_native() {
            return mutex.lock();
        }

        loop {
            self.enter_native();
            let guard = mutex.lock();
            if self.attempt_leave_native_no_block() {
                return guard;
            }

            drop(guard);
            self.check_block();
        }
    }

    /// Wait on `cv` inside a native region. Returns `true` on timeout.
    /// Current thread only.
    ///
    /// Callers must recheck their condition in a loop: when a suspension is
    /// pending on wakeup the thread passes one notification on to another
    /// waiter of `cv` before blocking, so the wakeup it consumed is not lost
    /// while it stays suspended.
    pub(crate) fn wait_with_handshake<T>(
        &self,
        cv: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> bool {
        if self.in_native() {
            return wait_until(cv, guard, deadline);
        }

        self.enter_native();
        let timed_out = wait_until(cv, guard, deadline);
        if !self.attempt_leave_native_no_block() {
            cv.notify_one();
            MutexGuard::unlocked(guard, || self.check_block());
        }
        timed_out
    }

    /// Safepoint poll. Blocks while suspended, delivers pending asynchronous
    /// interrupts and runs the engine hook. Current thread only.
    pub fn safepoint_poll(&self) {
        if self.yieldpoints_disabled.load(Ordering::Relaxed) > 0 {
            if self.take_yieldpoint.swap(false, Ordering::AcqRel)
                || self.pending_async_interrupt.load(Ordering::Relaxed)
            {
                self.yieldpoint_request_pending
                    .store(true, Ordering::Relaxed);
            }
            return;
        }

        if self.take_yieldpoint.swap(false, Ordering::AcqRel) {
            self.check_block();
        }

        if self.pending_async_interrupt.swap(false, Ordering::AcqRel) {
            self.runtime.deliver_interrupt(self);
        }

        self.runtime.at_safepoint(self);
    }

    pub fn yieldpoints_enabled(&self) -> bool {
        self.yieldpoints_disabled.load(Ordering::Relaxed) == 0
    }

    /// Defer safepoint requests until the matching [`enable_yieldpoints`](Self::enable_yieldpoints).
    pub fn disable_yieldpoints(&self) {
        self.yieldpoints_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enable_yieldpoints(&self) {
        let prev = self.yieldpoints_disabled.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            fatal!("unbalanced enable_yieldpoints on thread {}", self.id);
        }

        if prev == 1 && self.yieldpoint_request_pending.swap(false, Ordering::Relaxed) {
            self.take_yieldpoint.store(true, Ordering::Release);
        }
    }

    /// Ask the engine to deliver an asynchronous interrupt at the next safepoint.
    pub fn post_async_interrupt(&self) {
        self.pending_async_interrupt.store(true, Ordering::Release);
        self.take_yieldpoint.store(true, Ordering::Release);
    }

    /// Set the interrupt flag and wake whatever the thread is blocked on.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.parker.wake();

        let blocker = self.blocker.lock().clone();
        if let Some(monitor) = blocker {
            monitor.wake_waiters();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Read and clear the interrupt flag.
    pub fn interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_blocker(&self, monitor: Option<Arc<HeavyMonitor>>) {
        *self.blocker.lock() = monitor;
    }

    pub fn owned_monitors(&self) -> Vec<MonitorRef> {
        self.owned.lock().to_vec()
    }

    pub fn holds(&self, monitor: &MonitorRef) -> bool {
        self.owned.lock().contains(monitor)
    }

    pub(crate) fn push_owned(&self, monitor: MonitorRef) {
        self.owned.lock().push(monitor);
    }

    pub(crate) fn remove_owned(&self, monitor: &MonitorRef) {
        let mut owned = self.owned.lock();
        if let Some(ix) = owned.iter().rposition(|m| m == monitor) {
            owned.remove(ix);
        }
    }

    pub(crate) fn take_owned(&self) -> SmallVec<[MonitorRef; 8]> {
        std::mem::take(&mut *self.owned.lock())
    }

    pub fn contended_monitor(&self) -> Option<MonitorRef> {
        self.contended.lock().clone()
    }

    pub fn wait_monitor(&self) -> Option<MonitorRef> {
        self.waiting_on.lock().clone()
    }

    /// Record that the thread blocks entering `monitor`. Nested calls for the
    /// same contention episode are ignored.
    pub(crate) fn begin_contended(&self, monitor: &MonitorRef) {
        let mut contended = self.contended.lock();
        if contended.is_some() {
            return;
        }
        *contended = Some(monitor.clone());
        drop(contended);

        let mut stats = self.stats.lock();
        stats.blocked_count += 1;
        stats.blocked_since = Some(Instant::now());
        drop(stats);

        self.set_activity(StateBits::BLOCKED_ON_ENTER);
    }

    pub(crate) fn end_contended(&self) {
        if self.contended.lock().take().is_none() {
            return;
        }

        let mut stats = self.stats.lock();
        if let Some(since) = stats.blocked_since.take() {
            stats.blocked_time += since.elapsed();
        }
        drop(stats);

        self.set_activity(StateBits::RUNNABLE);
    }

    pub(crate) fn begin_wait(&self, monitor: &MonitorRef, timed: bool) {
        *self.waiting_on.lock() = Some(monitor.clone());

        let mut stats = self.stats.lock();
        stats.waited_count += 1;
        stats.waited_since = Some(Instant::now());
        drop(stats);

        let timing = if timed {
            StateBits::WAITING_TIMED
        } else {
            StateBits::WAITING_INDEFINITE
        };
        self.set_activity(StateBits::WAITING | timing | StateBits::IN_OBJECT_WAIT);
    }

    pub(crate) fn end_wait(&self) {
        *self.waiting_on.lock() = None;

        let mut stats = self.stats.lock();
        if let Some(since) = stats.waited_since.take() {
            stats.waited_time += since.elapsed();
        }
        drop(stats);

        self.set_activity(StateBits::RUNNABLE);
    }

    pub fn cpu_time(&self) -> Option<Duration> {
        if self.is_alive() {
            self.native.cpu_time()
        } else {
            None
        }
    }

    pub fn info(&self) -> ThreadInfo {
        let stats = self.stats.lock();
        let blocked_time = stats.blocked_time
            + stats
                .blocked_since
                .map(|since| since.elapsed())
                .unwrap_or_default();
        let waited_time = stats.waited_time
            + stats
                .waited_since
                .map(|since| since.elapsed())
                .unwrap_or_default();
        let (blocked_count, waited_count) = (stats.blocked_count, stats.waited_count);
        drop(stats);

        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            priority: self.priority(),
            daemon: self.daemon,
            suspend_count: self.suspend_count(),
            interrupted: self.is_interrupted(),
            contended_monitor: self.contended_monitor(),
            wait_monitor: self.wait_monitor(),
            owned_monitors: self.owned_monitors(),
            blocked_count,
            blocked_time,
            waited_count,
            waited_time,
            cpu_time: self.cpu_time(),
        }
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        self.ids.release(self.id);
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("exec", &self.exec_status())
            .finish()
    }
}

fn wait_until<T>(cv: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => cv.wait_until(guard, deadline).timed_out(),
        None => {
            cv.wait(guard);
            false
        }
    }
}
