//! Intrinsic object monitors: thin locks in the lock word, inflated to a
//! [`HeavyMonitor`] on contention or `wait`.

use std::{sync::Arc, time::Duration};

use crate::{
    error::{ThreadError, WaitResult},
    objectmodel::ObjectRef,
    options::ThreadingOptions,
    runtime::{registry::ThreadRegistry, threads::ThreadRecord},
    sync::{
        lock_word::{LockWord, MAX_THIN_OWNER, MAX_THIN_RECURSION},
        monitor_table::MonitorTable,
        HeavyMonitor, MonitorRef,
    },
    utils::yield_now,
};

pub struct ObjectSynchronizer {
    table: Arc<MonitorTable>,
    registry: Arc<ThreadRegistry>,
    thin_lock_spins: usize,
    trace: bool,
}

impl ObjectSynchronizer {
    pub fn new(
        table: Arc<MonitorTable>,
        registry: Arc<ThreadRegistry>,
        options: &ThreadingOptions,
    ) -> Self {
        Self {
            table,
            registry,
            thin_lock_spins: options.thin_lock_spins,
            trace: options.trace_monitors,
        }
    }

    /// Turn `observed` into an inflated word. Losing the CAS is fine, the
    /// caller reloads the word and retries.
    fn inflate(&self, object: &ObjectRef, observed: LockWord) -> Result<(), ThreadError> {
        let (owner, recursion) = match observed {
            LockWord::Inflated { .. } => return Ok(()),
            LockWord::Free => (None, 0),
            LockWord::Thin { owner, recursion } => {
                let Some(record) = self.registry.get(owner) else {
                    return Err(ThreadError::InternalError(
                        "thin lock owner is not a registered thread",
                    ));
                };
                (Some(record), recursion as usize)
            }
        };

        let monitor = self.table.allocate_object_monitor(object, owner, recursion)?;
        let inflated = LockWord::Inflated {
            index: monitor.index(),
        };

        match object.lock_word().compare_exchange(observed, inflated) {
            Ok(()) => {
                if self.trace {
                    log::trace!(
                        target: "vmkit::threads",
                        "inflated {:?} from {:?} to monitor {}",
                        object,
                        observed,
                        monitor.index()
                    );
                }
                Ok(())
            }
            Err(_) => {
                self.table.release_unpublished(monitor.index());
                Ok(())
            }
        }
    }

    fn heavy(&self, index: u32) -> Result<Arc<HeavyMonitor>, ThreadError> {
        self.table.object_monitor(index)
    }

    /// Inflated monitor of `object`, if it has one.
    pub fn monitor_of(&self, object: &ObjectRef) -> Option<Arc<HeavyMonitor>> {
        match object.lock_word().load() {
            LockWord::Inflated { index } => self.table.get(index),
            _ => None,
        }
    }

    /// Acquire the monitor of `object` for `thread` (the caller).
    pub fn enter(&self, object: &ObjectRef, thread: &Arc<ThreadRecord>) -> Result<(), ThreadError> {
        let mref = MonitorRef::Object(object.clone());
        let result = self.enter_inner(object, thread, &mref);
        thread.end_contended();
        result
    }

    fn enter_inner(
        &self,
        object: &ObjectRef,
        thread: &Arc<ThreadRecord>,
        mref: &MonitorRef,
    ) -> Result<(), ThreadError> {
        let me = thread.id();
        let cell = object.lock_word();
        let mut spins = 0;

        loop {
            let word = cell.load();
            match word {
                LockWord::Free if me.as_u64() > MAX_THIN_OWNER => {
                    self.inflate(object, word)?;
                }

                LockWord::Free => {
                    let thin = LockWord::Thin {
                        owner: me,
                        recursion: 0,
                    };
                    if cell.compare_exchange(word, thin).is_ok() {
                        thread.push_owned(mref.clone());
                        return Ok(());
                    }
                }

                LockWord::Thin { owner, recursion } if owner == me => {
                    if recursion == MAX_THIN_RECURSION {
                        self.inflate(object, word)?;
                        continue;
                    }

                    let deeper = LockWord::Thin {
                        owner: me,
                        recursion: recursion + 1,
                    };
                    // only a concurrent inflation can make this fail
                    if cell.compare_exchange(word, deeper).is_ok() {
                        return Ok(());
                    }
                }

                LockWord::Thin { .. } => {
                    thread.begin_contended(mref);
                    spins += 1;
                    if spins >= self.thin_lock_spins {
                        self.inflate(object, word)?;
                        continue;
                    }

                    yield_now();
                    thread.safepoint_poll();
                }

                LockWord::Inflated { index } => {
                    return self.heavy(index)?.enter(thread, mref);
                }
            }
        }
    }

    /// Acquire without blocking and without inflating.
    pub fn try_enter(
        &self,
        object: &ObjectRef,
        thread: &Arc<ThreadRecord>,
    ) -> Result<bool, ThreadError> {
        let me = thread.id();
        let cell = object.lock_word();
        let mref = MonitorRef::Object(object.clone());

        loop {
            let word = cell.load();
            match word {
                LockWord::Free if me.as_u64() > MAX_THIN_OWNER => return Ok(false),

                LockWord::Free => {
                    let thin = LockWord::Thin {
                        owner: me,
                        recursion: 0,
                    };
                    if cell.compare_exchange(word, thin).is_ok() {
                        thread.push_owned(mref);
                        return Ok(true);
                    }
                }

                LockWord::Thin { owner, recursion } if owner == me => {
                    if recursion == MAX_THIN_RECURSION {
                        return Ok(false);
                    }

                    let deeper = LockWord::Thin {
                        owner: me,
                        recursion: recursion + 1,
                    };
                    if cell.compare_exchange(word, deeper).is_ok() {
                        return Ok(true);
                    }
                }

                LockWord::Thin { .. } => return Ok(false),

                LockWord::Inflated { index } => {
                    return self.heavy(index)?.try_enter(thread, &mref);
                }
            }
        }
    }

    pub fn exit(&self, object: &ObjectRef, thread: &ThreadRecord) -> Result<(), ThreadError> {
        let me = thread.id();
        let cell = object.lock_word();

        loop {
            let word = cell.load();
            match word {
                LockWord::Thin { owner, recursion } if owner == me => {
                    let next = if recursion > 0 {
                        LockWord::Thin {
                            owner: me,
                            recursion: recursion - 1,
                        }
                    } else {
                        LockWord::Free
                    };

                    if cell.compare_exchange(word, next).is_ok() {
                        if next.is_free() {
                            thread.remove_owned(&MonitorRef::Object(object.clone()));
                        }
                        return Ok(());
                    }
                }

                LockWord::Free | LockWord::Thin { .. } => {
                    return Err(ThreadError::IllegalMonitorState)
                }

                LockWord::Inflated { index } => {
                    return self
                        .heavy(index)?
                        .exit(thread, &MonitorRef::Object(object.clone()))
                        .map(|_| ());
                }
            }
        }
    }

    /// Wait on the monitor of `object`. Thin words are inflated first.
    pub fn wait(
        &self,
        object: &ObjectRef,
        thread: &Arc<ThreadRecord>,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, ThreadError> {
        let me = thread.id();
        let cell = object.lock_word();

        loop {
            let word = cell.load();
            match word {
                LockWord::Thin { owner, .. } if owner == me => {
                    self.inflate(object, word)?;
                }

                LockWord::Free | LockWord::Thin { .. } => {
                    return Err(ThreadError::IllegalMonitorState)
                }

                LockWord::Inflated { index } => {
                    return self.heavy(index)?.wait(
                        thread,
                        &MonitorRef::Object(object.clone()),
                        timeout,
                    );
                }
            }
        }
    }

    pub fn notify(&self, object: &ObjectRef, thread: &ThreadRecord) -> Result<(), ThreadError> {
        match object.lock_word().load() {
            LockWord::Thin { owner, .. } if owner == thread.id() => Ok(()),
            LockWord::Free | LockWord::Thin { .. } => Err(ThreadError::IllegalMonitorState),
            LockWord::Inflated { index } => self.heavy(index)?.notify(thread),
        }
    }

    pub fn notify_all(&self, object: &ObjectRef, thread: &ThreadRecord) -> Result<(), ThreadError> {
        match object.lock_word().load() {
            LockWord::Thin { owner, .. } if owner == thread.id() => Ok(()),
            LockWord::Free | LockWord::Thin { .. } => Err(ThreadError::IllegalMonitorState),
            LockWord::Inflated { index } => self.heavy(index)?.notify_all(thread),
        }
    }

    /// Whether `thread` currently owns the monitor of `object`.
    pub fn holds_lock(&self, object: &ObjectRef, thread: &ThreadRecord) -> bool {
        match object.lock_word().load() {
            LockWord::Thin { owner, .. } => owner == thread.id(),
            LockWord::Inflated { index } => self
                .table
                .get(index)
                .is_some_and(|monitor| monitor.owner_id() == Some(thread.id())),
            LockWord::Free => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;
    use crate::{
        mock::{MockObject, MockRuntime},
        runtime::threads::StateBits,
    };

    fn setup(spins: usize) -> (Arc<ThreadRegistry>, Arc<MonitorTable>, Arc<ObjectSynchronizer>) {
        let options = ThreadingOptions {
            thin_lock_spins: spins,
            ..Default::default()
        };
        let table = Arc::new(MonitorTable::new(&options));
        let registry = Arc::new(ThreadRegistry::new(table.clone()));
        let sync = Arc::new(ObjectSynchronizer::new(
            table.clone(),
            registry.clone(),
            &options,
        ));
        (registry, table, sync)
    }

    #[test]
    fn thin_recursion() {
        let (registry, table, sync) = setup(64);
        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();
        let object = MockObject::new_ref();

        sync.enter(&object, &thread).unwrap();
        sync.enter(&object, &thread).unwrap();
        assert_eq!(
            object.lock_word().load(),
            LockWord::Thin {
                owner: thread.id(),
                recursion: 1
            }
        );

        sync.exit(&object, &thread).unwrap();
        assert!(sync.holds_lock(&object, &thread));
        assert_eq!(thread.owned_monitors().len(), 1);

        sync.exit(&object, &thread).unwrap();
        assert!(object.lock_word().load().is_free());
        assert!(thread.owned_monitors().is_empty());
        assert_eq!(
            sync.exit(&object, &thread),
            Err(ThreadError::IllegalMonitorState)
        );
        assert!(table.is_empty());

        registry.detach(&thread);
    }

    #[test]
    fn wait_inflates_and_times_out() {
        let (registry, table, sync) = setup(64);
        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();
        let object = MockObject::new_ref();

        assert_eq!(
            sync.wait(&object, &thread, Some(Duration::from_millis(1))),
            Err(ThreadError::IllegalMonitorState)
        );
        assert_eq!(
            sync.notify(&object, &thread),
            Err(ThreadError::IllegalMonitorState)
        );

        sync.enter(&object, &thread).unwrap();
        sync.enter(&object, &thread).unwrap();
        // notify on a thin word is a no-op
        sync.notify(&object, &thread).unwrap();

        let start = Instant::now();
        assert_eq!(
            sync.wait(&object, &thread, Some(Duration::from_millis(50))),
            Ok(WaitResult::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(object.lock_word().load().is_inflated());
        assert_eq!(table.len(), 1);

        let monitor = sync.monitor_of(&object).unwrap();
        assert_eq!(monitor.entry_count(), 2);
        assert_eq!(thread.info().waited_count, 1);
        assert!(!thread.state().is_waiting());

        sync.exit(&object, &thread).unwrap();
        sync.exit(&object, &thread).unwrap();
        assert_eq!(monitor.owner_id(), None);
        // inflation is one-way
        assert!(object.lock_word().load().is_inflated());

        registry.detach(&thread);
    }

    #[test]
    fn try_enter_never_inflates() {
        let (registry, table, sync) = setup(64);
        let runtime = MockRuntime::new();
        let object = MockObject::new_ref();
        let (locked_tx, locked_rx) = flume::bounded(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);

        let holder = {
            let registry = registry.clone();
            let sync = sync.clone();
            let object = object.clone();
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("holder", false, runtime).unwrap();
                sync.enter(&object, &thread).unwrap();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                sync.exit(&object, &thread).unwrap();
                registry.detach(&thread);
            })
        };

        locked_rx.recv().unwrap();
        let thread = registry.attach("main", false, runtime).unwrap();
        assert_eq!(sync.try_enter(&object, &thread), Ok(false));
        assert!(!object.lock_word().load().is_inflated());
        assert!(table.is_empty());

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(sync.try_enter(&object, &thread), Ok(true));
        sync.exit(&object, &thread).unwrap();
        registry.detach(&thread);
    }

    #[test]
    fn contention_inflates_once() {
        let (registry, table, sync) = setup(4);
        let runtime = MockRuntime::new();
        let object = MockObject::new_ref();
        let counter = Arc::new(AtomicUsize::new(0));
        let (ready_tx, ready_rx) = flume::unbounded();

        let handles = (0..4)
            .map(|i| {
                let registry = registry.clone();
                let sync = sync.clone();
                let object = object.clone();
                let runtime = runtime.clone();
                let counter = counter.clone();
                let ready_tx = ready_tx.clone();
                std::thread::spawn(move || {
                    let thread = registry
                        .attach(&format!("worker-{i}"), false, runtime)
                        .unwrap();
                    ready_tx.send(()).unwrap();
                    for _ in 0..500 {
                        sync.enter(&object, &thread).unwrap();
                        // non-atomic read-modify-write, guarded by the monitor
                        let value = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(value + 1, Ordering::Relaxed);
                        sync.exit(&object, &thread).unwrap();
                    }
                    assert!(thread.owned_monitors().is_empty());
                    registry.detach(&thread);
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..4 {
            ready_rx.recv().unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 2000);
        // at most one monitor ever got published for the object
        assert!(table.len() <= 1);
    }

    #[test]
    fn notify_wakes_waiter() {
        let (registry, _table, sync) = setup(64);
        let runtime = MockRuntime::new();
        let object = MockObject::new_ref();
        let (tx, rx) = flume::bounded(1);

        let waiter = {
            let registry = registry.clone();
            let sync = sync.clone();
            let object = object.clone();
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("waiter", false, runtime).unwrap();
                sync.enter(&object, &thread).unwrap();
                tx.send(thread.clone()).unwrap();
                let result = sync.wait(&object, &thread, Some(Duration::from_secs(10)));
                assert!(sync.holds_lock(&object, &thread));
                sync.exit(&object, &thread).unwrap();
                registry.detach(&thread);
                result
            })
        };

        let waiting = rx.recv().unwrap();
        while !waiting.state().contains(StateBits::IN_OBJECT_WAIT) {
            std::thread::yield_now();
        }

        let thread = registry.attach("main", false, runtime).unwrap();
        sync.enter(&object, &thread).unwrap();
        assert_eq!(
            waiting.wait_monitor(),
            Some(MonitorRef::Object(object.clone()))
        );
        sync.notify(&object, &thread).unwrap();
        sync.exit(&object, &thread).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(WaitResult::Woken));
        registry.detach(&thread);
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let (registry, _table, sync) = setup(64);
        let runtime = MockRuntime::new();
        let object = MockObject::new_ref();
        let (tx, rx) = flume::bounded(1);

        let waiter = {
            let registry = registry.clone();
            let sync = sync.clone();
            let object = object.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("waiter", false, runtime).unwrap();
                sync.enter(&object, &thread).unwrap();
                tx.send(thread.clone()).unwrap();
                let result = sync.wait(&object, &thread, None);
                let still_interrupted = thread.is_interrupted();
                sync.exit(&object, &thread).unwrap();
                registry.detach(&thread);
                (result, still_interrupted)
            })
        };

        let waiting = rx.recv().unwrap();
        while !waiting.state().contains(StateBits::IN_OBJECT_WAIT) {
            std::thread::yield_now();
        }
        waiting.interrupt();

        assert_eq!(waiter.join().unwrap(), (Ok(WaitResult::Interrupted), false));
    }
}
