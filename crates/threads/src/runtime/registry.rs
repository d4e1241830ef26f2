use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{fatal, ThreadError},
    options::ThreadingOptions,
    runtime::{
        threads::{ThreadId, ThreadRecord},
        SafepointPollable,
    },
    sync::monitor_table::MonitorTable,
};

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// The record attached to the calling OS thread, if any.
pub fn current_thread() -> Option<Arc<ThreadRecord>> {
    CURRENT.with(|current| current.borrow().clone())
}

struct IdPoolInner {
    next: u64,
    free: BinaryHeap<Reverse<u64>>,
}

/// Thread ids. Freed ids are reused smallest first, so thin lock words keep
/// fitting their owner field.
pub struct IdPool {
    inner: Mutex<IdPoolInner>,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdPoolInner {
                next: 1,
                free: BinaryHeap::new(),
            }),
        }
    }

    pub fn acquire(&self) -> ThreadId {
        let mut inner = self.inner.lock();
        let raw = match inner.free.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = inner.next;
                inner.next += 1;
                id
            }
        };

        match ThreadId::from_u64(raw) {
            Some(id) => id,
            None => fatal!("thread id pool handed out the reserved id"),
        }
    }

    pub fn release(&self, id: ThreadId) {
        self.inner.lock().free.push(Reverse(id.as_u64()));
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadCounters {
    pub live: usize,
    pub daemon: usize,
    pub peak: usize,
    pub total_started: usize,
}

/// All attached threads.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    /// Where leftover monitors of detaching threads are released.
    monitors: Arc<MonitorTable>,
    cv_join: Condvar,
    ids: Arc<IdPool>,
    live: AtomicUsize,
    daemon: AtomicUsize,
    peak: AtomicUsize,
    total_started: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new(monitors: Arc<MonitorTable>) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            monitors,
            cv_join: Condvar::new(),
            ids: Arc::new(IdPool::new()),
            live: AtomicUsize::new(0),
            daemon: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total_started: AtomicUsize::new(0),
        }
    }

    /// Create a record for the calling OS thread and make it current.
    pub fn attach(
        &self,
        name: &str,
        daemon: bool,
        runtime: Arc<dyn SafepointPollable>,
    ) -> Result<Arc<ThreadRecord>, ThreadError> {
        if current_thread().is_some() {
            return Err(ThreadError::InternalError("thread is already attached"));
        }

        let id = self.ids.acquire();
        let record = Arc::new(ThreadRecord::new(
            id,
            name.to_owned(),
            daemon,
            runtime,
            self.ids.clone(),
        ));

        let mut threads = self.threads.lock();
        if threads.try_reserve(1).is_err() {
            return Err(ThreadError::OutOfMemory);
        }
        record
            .index_in_registry
            .store(threads.len(), Ordering::Relaxed);
        threads.push(record.clone());

        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        if daemon {
            self.daemon.fetch_add(1, Ordering::Relaxed);
        }
        self.peak.fetch_max(live, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
        drop(threads);

        CURRENT.with(|current| *current.borrow_mut() = Some(record.clone()));
        log::debug!(target: "vmkit::threads", "attached thread {} ({})", id, name);
        Ok(record)
    }

    /// Remove `thread` from the registry and mark it terminated. Detaching the
    /// same record twice aborts the process.
    ///
    /// Monitors the thread still holds are force-released with a warning
    /// before its id can be handed out again. A thin lock word left behind
    /// would otherwise be inherited by the next thread with that id.
    pub fn detach(&self, thread: &Arc<ThreadRecord>) {
        if thread.detached.swap(true, Ordering::AcqRel) {
            fatal!("thread {} detached twice", thread.id());
        }

        self.monitors.release_owned(thread);

        let mut threads = self.threads.lock();
        let idx = thread.index_in_registry.load(Ordering::Relaxed);
        if idx >= threads.len() || !Arc::ptr_eq(&threads[idx], thread) {
            fatal!("registry index of thread {} is corrupted", thread.id());
        }

        let last = threads.swap_remove(idx);
        debug_assert!(Arc::ptr_eq(&last, thread));
        if idx < threads.len() {
            threads[idx].index_in_registry.store(idx, Ordering::Relaxed);
        }

        self.live.fetch_sub(1, Ordering::Relaxed);
        if thread.is_daemon() {
            self.daemon.fetch_sub(1, Ordering::Relaxed);
        }
        self.cv_join.notify_all();
        drop(threads);

        thread.mark_terminated();

        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, thread)) {
                *current = None;
            }
        });

        log::debug!(target: "vmkit::threads", "detached thread {}", thread.id());
    }

    pub fn monitors(&self) -> &Arc<MonitorTable> {
        &self.monitors
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads
            .lock()
            .iter()
            .find(|thread| thread.id() == id)
            .cloned()
    }

    /// Snapshot of all attached threads.
    pub fn threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<ThreadRecord>)) {
        for thread in self.threads().iter() {
            f(thread);
        }
    }

    pub fn counters(&self) -> ThreadCounters {
        ThreadCounters {
            live: self.live.load(Ordering::Relaxed),
            daemon: self.daemon.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            total_started: self.total_started.load(Ordering::Relaxed),
        }
    }

    /// Reset the peak to the current live count.
    pub fn reset_peak(&self) {
        self.peak
            .store(self.live.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Block until every non-daemon thread other than the caller detached.
    pub fn join_non_daemon(&self) {
        let me = current_thread();
        let mut threads = self.threads.lock();

        while threads.iter().any(|thread| {
            !thread.is_daemon() && !me.as_ref().is_some_and(|me| Arc::ptr_eq(me, thread))
        }) {
            match &me {
                Some(me) => {
                    me.wait_with_handshake(&self.cv_join, &mut threads, None);
                }
                None => self.cv_join.wait(&mut threads),
            }
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MonitorTable::new(&ThreadingOptions::default())))
    }
}
