use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{ThreadError, WaitResult},
    objectmodel::{ObjectRef, WeakObjectRef},
    runtime::threads::{ThreadId, ThreadRecord},
};

pub mod lock_word;
pub mod monitor_table;
pub mod object_monitor;

use monitor_table::RawMonitorHandle;

/// Something a thread can own or block on.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MonitorRef {
    /// The intrinsic monitor of an object.
    Object(ObjectRef),
    Raw(RawMonitorHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorKind {
    /// Backs an inflated object lock word. The slot is reclaimable once the
    /// object is dropped.
    Object(WeakObjectRef),
    Raw { name: String },
}

struct WaitTicket {
    ticket: u64,
    notified: bool,
}

struct MonitorState {
    owner: Option<Arc<ThreadRecord>>,
    /// Entries beyond the first.
    recursion: usize,
    entry_waiters: usize,
    waiters: VecDeque<WaitTicket>,
    next_ticket: u64,
    destroyed: bool,
}

impl MonitorState {
    fn owned_by(&self, thread: &ThreadRecord) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(Arc::as_ptr(owner), thread))
    }
}

/// A heavyweight monitor: a recursive mutex with a wait set, built from a
/// mutex and two condition variables.
///
/// Blocking paths enter a native region around the OS-level wait, so a
/// thread blocked here never delays a suspension request.
pub struct HeavyMonitor {
    index: u32,
    kind: MonitorKind,
    state: Mutex<MonitorState>,
    enter_cv: Condvar,
    wait_cv: Condvar,
}

impl HeavyMonitor {
    pub(crate) fn new(
        index: u32,
        kind: MonitorKind,
        owner: Option<Arc<ThreadRecord>>,
        recursion: usize,
    ) -> Self {
        Self {
            index,
            kind,
            state: Mutex::new(MonitorState {
                recursion: if owner.is_some() { recursion } else { 0 },
                owner,
                entry_waiters: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
                destroyed: false,
            }),
            enter_cv: Condvar::new(),
            wait_cv: Condvar::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> &MonitorKind {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            MonitorKind::Raw { name } => Some(name),
            MonitorKind::Object(_) => None,
        }
    }

    pub fn owner(&self) -> Option<Arc<ThreadRecord>> {
        self.state.lock().owner.clone()
    }

    pub fn owner_id(&self) -> Option<ThreadId> {
        self.state.lock().owner.as_ref().map(|owner| owner.id())
    }

    /// Hold count of the owner, 0 when free.
    pub fn entry_count(&self) -> usize {
        let state = self.state.lock();
        if state.owner.is_some() {
            state.recursion + 1
        } else {
            0
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_contended(&self) -> bool {
        self.state.lock().entry_waiters > 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Blocking enter. `thread` must be the caller.
    pub fn enter(&self, thread: &Arc<ThreadRecord>, mref: &MonitorRef) -> Result<(), ThreadError> {
        let mut state = thread.lock_with_handshake(&self.state);
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if state.owned_by(thread) {
            state.recursion = state
                .recursion
                .checked_add(1)
                .ok_or(ThreadError::InternalError("monitor recursion overflow"))?;
            return Ok(());
        }

        if state.owner.is_some() {
            thread.begin_contended(mref);
            state.entry_waiters += 1;
            while state.owner.is_some() && !state.destroyed {
                thread.wait_with_handshake(&self.enter_cv, &mut state, None);
            }
            state.entry_waiters -= 1;
            thread.end_contended();

            if state.destroyed {
                return Err(ThreadError::InvalidMonitor);
            }
        }

        state.owner = Some(thread.clone());
        state.recursion = 0;
        drop(state);

        thread.push_owned(mref.clone());
        Ok(())
    }

    /// Enter without blocking. `Ok(false)` when another thread holds the monitor.
    pub fn try_enter(
        &self,
        thread: &Arc<ThreadRecord>,
        mref: &MonitorRef,
    ) -> Result<bool, ThreadError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if state.owned_by(thread) {
            state.recursion = state
                .recursion
                .checked_add(1)
                .ok_or(ThreadError::InternalError("monitor recursion overflow"))?;
            return Ok(true);
        }

        if state.owner.is_some() {
            return Ok(false);
        }

        state.owner = Some(thread.clone());
        state.recursion = 0;
        drop(state);

        thread.push_owned(mref.clone());
        Ok(true)
    }

    /// Returns `true` when the monitor was fully released.
    pub fn exit(&self, thread: &ThreadRecord, mref: &MonitorRef) -> Result<bool, ThreadError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if !state.owned_by(thread) {
            return Err(ThreadError::IllegalMonitorState);
        }

        if state.recursion > 0 {
            state.recursion -= 1;
            return Ok(false);
        }

        state.owner = None;
        if state.entry_waiters > 0 {
            self.enter_cv.notify_one();
        }
        drop(state);

        thread.remove_owned(mref);
        Ok(true)
    }

    /// Release ownership completely, wait for a notification, an interrupt or
    /// the timeout, then re-acquire with the saved recursion.
    ///
    /// `Some(Duration::ZERO)` times out immediately after releasing.
    pub fn wait(
        self: &Arc<Self>,
        thread: &Arc<ThreadRecord>,
        mref: &MonitorRef,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, ThreadError> {
        let mut state = thread.lock_with_handshake(&self.state);
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if !state.owned_by(thread) {
            return Err(ThreadError::IllegalMonitorState);
        }

        if thread.interrupted() {
            return Ok(WaitResult::Interrupted);
        }

        let saved_recursion = state.recursion;
        state.owner = None;
        state.recursion = 0;
        if state.entry_waiters > 0 {
            self.enter_cv.notify_one();
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(WaitTicket {
            ticket,
            notified: false,
        });

        thread.remove_owned(mref);
        thread.set_blocker(Some(self.clone()));
        thread.begin_wait(mref, timeout.is_some());

        let deadline = match timeout {
            Some(timeout) => Some(Instant::now().checked_add(timeout)),
            None => None,
        };

        let result = loop {
            if state.destroyed {
                break None;
            }

            let notified = state
                .waiters
                .iter()
                .any(|waiter| waiter.ticket == ticket && waiter.notified);
            if notified {
                break Some(WaitResult::Woken);
            }

            if thread.interrupted() {
                break Some(WaitResult::Interrupted);
            }

            match deadline {
                Some(Some(deadline)) if Instant::now() >= deadline => {
                    break Some(WaitResult::TimedOut)
                }
                Some(Some(deadline)) => {
                    thread.wait_with_handshake(&self.wait_cv, &mut state, Some(deadline));
                }
                // timeouts too large to represent wait forever
                Some(None) | None => {
                    thread.wait_with_handshake(&self.wait_cv, &mut state, None);
                }
            }
        };

        state.waiters.retain(|waiter| waiter.ticket != ticket);
        thread.set_blocker(None);
        thread.end_wait();

        let Some(result) = result else {
            return Err(ThreadError::InvalidMonitor);
        };

        if state.owner.is_some() {
            thread.begin_contended(mref);
            state.entry_waiters += 1;
            while state.owner.is_some() && !state.destroyed {
                thread.wait_with_handshake(&self.enter_cv, &mut state, None);
            }
            state.entry_waiters -= 1;
            thread.end_contended();

            if state.destroyed {
                return Err(ThreadError::InvalidMonitor);
            }
        }

        state.owner = Some(thread.clone());
        state.recursion = saved_recursion;
        drop(state);

        thread.push_owned(mref.clone());
        Ok(result)
    }

    /// Wake the longest waiting thread that was not notified yet.
    pub fn notify(&self, thread: &ThreadRecord) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if !state.owned_by(thread) {
            return Err(ThreadError::IllegalMonitorState);
        }

        if let Some(waiter) = state.waiters.iter_mut().find(|waiter| !waiter.notified) {
            waiter.notified = true;
            self.wait_cv.notify_all();
        }
        Ok(())
    }

    pub fn notify_all(&self, thread: &ThreadRecord) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(ThreadError::InvalidMonitor);
        }

        if !state.owned_by(thread) {
            return Err(ThreadError::IllegalMonitorState);
        }

        if !state.waiters.is_empty() {
            state
                .waiters
                .iter_mut()
                .for_each(|waiter| waiter.notified = true);
            self.wait_cv.notify_all();
        }
        Ok(())
    }

    /// Let waiters re-check their interrupt flag.
    pub(crate) fn wake_waiters(&self) {
        let _state = self.state.lock();
        self.wait_cv.notify_all();
    }

    /// Mark the monitor dead and wake everyone blocked on it. Returns the
    /// thread that held it, if any.
    pub(crate) fn destroy(&self) -> Option<Arc<ThreadRecord>> {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.recursion = 0;
        let owner = state.owner.take();
        self.enter_cv.notify_all();
        self.wait_cv.notify_all();
        owner
    }

    /// Drop ownership held by `thread` regardless of recursion. Returns `false`
    /// when `thread` is not the owner.
    pub(crate) fn force_release(&self, thread: &ThreadRecord) -> bool {
        let mut state = self.state.lock();
        if !state.owned_by(thread) {
            return false;
        }

        state.owner = None;
        state.recursion = 0;
        if state.entry_waiters > 0 {
            self.enter_cv.notify_one();
        }
        true
    }
}

impl std::fmt::Debug for HeavyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeavyMonitor")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("owner", &self.owner_id())
            .finish()
    }
}
