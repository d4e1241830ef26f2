//! Slot array of heavyweight monitors.
//!
//! Slots back inflated object lock words as well as raw monitors created by
//! name. Slot 0 is reserved so a zeroed handle never resolves.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
    error::{ThreadError, WaitResult},
    objectmodel::ObjectRef,
    options::ThreadingOptions,
    runtime::threads::{ThreadId, ThreadRecord},
    sync::{lock_word::LockWord, HeavyMonitor, MonitorKind, MonitorRef},
};

/// Opaque handle to a raw monitor.
///
/// Handles are plain slot indices. After [`MonitorTable::destroy`] the index
/// goes back to a free list and a later [`MonitorTable::create`] may hand it
/// out again, so a stale handle can silently resolve to an unrelated monitor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawMonitorHandle(u32);

impl RawMonitorHandle {
    pub const INVALID: Self = Self(0);

    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for RawMonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawMonitor({})", self.0)
    }
}

struct Slots {
    slots: Vec<Option<Arc<HeavyMonitor>>>,
    free: Vec<u32>,
}

pub struct MonitorTable {
    inner: Mutex<Slots>,
    max_monitors: usize,
    trace: bool,
}

impl MonitorTable {
    pub fn new(options: &ThreadingOptions) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: vec![None],
                free: Vec::new(),
            }),
            max_monitors: options.max_monitors,
            trace: options.trace_monitors,
        }
    }

    fn allocate(
        &self,
        kind: MonitorKind,
        owner: Option<Arc<ThreadRecord>>,
        recursion: usize,
    ) -> Result<Arc<HeavyMonitor>, ThreadError> {
        let mut inner = self.inner.lock();

        if inner.free.is_empty() && inner.slots.len() > self.max_monitors {
            let reclaimed = Self::reclaim_locked(&mut inner);
            if reclaimed == 0 {
                log::warn!(
                    target: "vmkit::threads",
                    "monitor table is full ({} monitors)",
                    self.max_monitors
                );
                return Err(ThreadError::OutOfMemory);
            }
            log::debug!(
                target: "vmkit::threads",
                "reclaimed {} monitors of dead objects",
                reclaimed
            );
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let index =
                    u32::try_from(inner.slots.len()).map_err(|_| ThreadError::OutOfMemory)?;
                inner
                    .slots
                    .try_reserve(1)
                    .map_err(|_| ThreadError::OutOfMemory)?;
                inner.slots.push(None);
                index
            }
        };

        let monitor = Arc::new(HeavyMonitor::new(index, kind, owner, recursion));
        inner.slots[index as usize] = Some(monitor.clone());
        Ok(monitor)
    }

    /// Allocate the monitor `object` inflates to. It starts out owned by
    /// `owner` with `recursion` extra entries.
    pub(crate) fn allocate_object_monitor(
        &self,
        object: &ObjectRef,
        owner: Option<Arc<ThreadRecord>>,
        recursion: usize,
    ) -> Result<Arc<HeavyMonitor>, ThreadError> {
        self.allocate(MonitorKind::Object(object.downgrade()), owner, recursion)
    }

    /// Free the slots of object monitors whose object has been dropped.
    ///
    /// Runs on its own when the table is full. Nothing can reach such a slot:
    /// the lock word that pointed at it died with the object, and owners and
    /// waiters keep the object alive.
    pub fn reclaim_dead(&self) -> usize {
        let reclaimed = Self::reclaim_locked(&mut self.inner.lock());
        if self.trace && reclaimed > 0 {
            log::trace!(target: "vmkit::threads", "reclaimed {} object monitors", reclaimed);
        }
        reclaimed
    }

    fn reclaim_locked(inner: &mut Slots) -> usize {
        let Slots { slots, free } = inner;
        let mut reclaimed = 0;
        for (index, slot) in slots.iter_mut().enumerate().skip(1) {
            let dead = matches!(
                slot.as_deref().map(HeavyMonitor::kind),
                Some(MonitorKind::Object(object)) if object.is_dead()
            );
            if dead {
                *slot = None;
                free.push(index as u32);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Return a slot nobody can reference yet, after losing an inflation race.
    pub(crate) fn release_unpublished(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(index as usize) {
            if slot.take().is_some() {
                inner.free.push(index);
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<Arc<HeavyMonitor>> {
        self.inner.lock().slots.get(index as usize)?.clone()
    }

    pub(crate) fn object_monitor(&self, index: u32) -> Result<Arc<HeavyMonitor>, ThreadError> {
        match self.get(index) {
            Some(monitor) if matches!(monitor.kind(), MonitorKind::Object(_)) => Ok(monitor),
            _ => Err(ThreadError::InternalError(
                "inflated lock word points at a non-object monitor",
            )),
        }
    }

    fn raw(&self, handle: RawMonitorHandle) -> Result<Arc<HeavyMonitor>, ThreadError> {
        match self.get(handle.0) {
            Some(monitor) if matches!(monitor.kind(), MonitorKind::Raw { .. }) => Ok(monitor),
            _ => Err(ThreadError::InvalidMonitor),
        }
    }

    /// Number of live monitors of either kind.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - 1 - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn raw_monitors(&self) -> Vec<(RawMonitorHandle, String)> {
        self.inner
            .lock()
            .slots
            .iter()
            .flatten()
            .filter_map(|monitor| {
                monitor
                    .name()
                    .map(|name| (RawMonitorHandle(monitor.index()), name.to_owned()))
            })
            .collect()
    }

    pub fn create(&self, name: &str) -> Result<RawMonitorHandle, ThreadError> {
        let monitor = self.allocate(
            MonitorKind::Raw {
                name: name.to_owned(),
            },
            None,
            0,
        )?;

        let handle = RawMonitorHandle(monitor.index());
        log::debug!(target: "vmkit::threads", "created raw monitor {:?} ({})", handle, name);
        Ok(handle)
    }

    /// Destroy a raw monitor even if it is held. Threads blocked on it fail
    /// with [`ThreadError::InvalidMonitor`].
    pub fn destroy(&self, handle: RawMonitorHandle) -> Result<(), ThreadError> {
        let monitor = {
            let mut inner = self.inner.lock();
            match inner.slots.get(handle.0 as usize) {
                Some(Some(monitor)) if matches!(monitor.kind(), MonitorKind::Raw { .. }) => {}
                _ => return Err(ThreadError::InvalidMonitor),
            }

            let monitor = inner.slots[handle.0 as usize].take();
            inner.free.push(handle.0);
            monitor
        };

        let Some(monitor) = monitor else {
            return Err(ThreadError::InvalidMonitor);
        };

        if let Some(owner) = monitor.destroy() {
            log::warn!(
                target: "vmkit::threads",
                "raw monitor {:?} destroyed while held by thread {}",
                handle,
                owner.id()
            );
            owner.remove_owned(&MonitorRef::Raw(handle));
        }

        log::debug!(target: "vmkit::threads", "destroyed raw monitor {:?}", handle);
        Ok(())
    }

    pub fn enter(
        &self,
        handle: RawMonitorHandle,
        thread: &Arc<ThreadRecord>,
    ) -> Result<(), ThreadError> {
        let monitor = self.raw(handle)?;
        if self.trace {
            log::trace!(target: "vmkit::threads", "thread {} enters {:?}", thread.id(), handle);
        }
        monitor.enter(thread, &MonitorRef::Raw(handle))
    }

    pub fn try_enter(
        &self,
        handle: RawMonitorHandle,
        thread: &Arc<ThreadRecord>,
    ) -> Result<bool, ThreadError> {
        self.raw(handle)?
            .try_enter(thread, &MonitorRef::Raw(handle))
    }

    pub fn exit(&self, handle: RawMonitorHandle, thread: &ThreadRecord) -> Result<(), ThreadError> {
        let monitor = self.raw(handle)?;
        if self.trace {
            log::trace!(target: "vmkit::threads", "thread {} exits {:?}", thread.id(), handle);
        }
        monitor.exit(thread, &MonitorRef::Raw(handle)).map(|_| ())
    }

    pub fn wait(
        &self,
        handle: RawMonitorHandle,
        thread: &Arc<ThreadRecord>,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, ThreadError> {
        self.raw(handle)?
            .wait(thread, &MonitorRef::Raw(handle), timeout)
    }

    pub fn notify(&self, handle: RawMonitorHandle, thread: &ThreadRecord) -> Result<(), ThreadError> {
        self.raw(handle)?.notify(thread)
    }

    pub fn notify_all(
        &self,
        handle: RawMonitorHandle,
        thread: &ThreadRecord,
    ) -> Result<(), ThreadError> {
        self.raw(handle)?.notify_all(thread)
    }

    pub fn owner(&self, handle: RawMonitorHandle) -> Result<Option<ThreadId>, ThreadError> {
        Ok(self.raw(handle)?.owner_id())
    }

    /// Release `monitor` if `thread` holds it, whatever the recursion. A thin
    /// lock word goes straight back to free.
    pub(crate) fn force_release(&self, monitor: &MonitorRef, thread: &ThreadRecord) -> bool {
        match monitor {
            MonitorRef::Raw(handle) => match self.raw(*handle) {
                Ok(monitor) => monitor.force_release(thread),
                Err(_) => false,
            },

            MonitorRef::Object(object) => {
                let cell = object.lock_word();
                loop {
                    let word = cell.load();
                    match word {
                        LockWord::Thin { owner, .. } if owner == thread.id() => {
                            if cell.compare_exchange(word, LockWord::Free).is_ok() {
                                return true;
                            }
                        }

                        LockWord::Inflated { index } => {
                            return self
                                .get(index)
                                .is_some_and(|monitor| monitor.force_release(thread));
                        }

                        _ => return false,
                    }
                }
            }
        }
    }

    /// Release everything `thread` still holds, newest first.
    pub(crate) fn release_owned(&self, thread: &ThreadRecord) {
        for monitor in thread.take_owned().iter().rev() {
            if self.force_release(monitor, thread) {
                log::warn!(
                    target: "vmkit::threads",
                    "thread {} ({}) detached while holding {:?}",
                    thread.id(),
                    thread.name(),
                    monitor
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockObject, MockRuntime},
        runtime::registry::ThreadRegistry,
        sync::object_monitor::ObjectSynchronizer,
    };

    fn table(max_monitors: usize) -> (Arc<MonitorTable>, ThreadRegistry) {
        let table = Arc::new(MonitorTable::new(&ThreadingOptions {
            max_monitors,
            ..Default::default()
        }));
        let registry = ThreadRegistry::new(table.clone());
        (table, registry)
    }

    #[test]
    fn handles_and_free_list() {
        let (table, _registry) = table(16);

        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        assert_eq!((a.as_raw(), b.as_raw()), (1, 2));
        assert_eq!(table.len(), 2);

        table.destroy(a).unwrap();
        assert_eq!(table.destroy(a), Err(ThreadError::InvalidMonitor));
        assert_eq!(
            table.destroy(RawMonitorHandle::INVALID),
            Err(ThreadError::InvalidMonitor)
        );

        // destroyed slots are reissued
        let c = table.create("c").unwrap();
        assert_eq!(c, a);
        assert_eq!(
            table.raw_monitors(),
            vec![(c, "c".to_owned()), (b, "b".to_owned())]
        );
    }

    #[test]
    fn table_limit_is_out_of_memory() {
        let (table, _registry) = table(2);
        table.create("a").unwrap();
        table.create("b").unwrap();
        assert_eq!(table.create("c"), Err(ThreadError::OutOfMemory));
    }

    #[test]
    fn dead_object_monitors_are_reclaimed() {
        let (table, registry) = table(4);
        let registry = Arc::new(registry);
        let sync = ObjectSynchronizer::new(table.clone(), registry.clone(), &ThreadingOptions::default());
        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();

        for _ in 0..8 {
            let object = MockObject::new_ref();
            sync.enter(&object, &thread).unwrap();
            // waiting inflates the lock word
            assert_eq!(
                sync.wait(&object, &thread, Some(Duration::ZERO)),
                Ok(WaitResult::TimedOut)
            );
            sync.exit(&object, &thread).unwrap();
            assert!(table.len() <= 4);
        }

        let live = MockObject::new_ref();
        sync.enter(&live, &thread).unwrap();
        sync.wait(&live, &thread, Some(Duration::ZERO)).unwrap();
        sync.exit(&live, &thread).unwrap();

        // only the live object's monitor survives
        table.reclaim_dead();
        assert_eq!(table.len(), 1);
        assert!(matches!(live.lock_word().load(), LockWord::Inflated { .. }));
        assert!(table.raw_monitors().is_empty());

        registry.detach(&thread);
    }

    #[test]
    fn raw_ops_reject_object_slots() {
        let (table, registry) = table(16);
        let object = MockObject::new_ref();
        let monitor = table.allocate_object_monitor(&object, None, 0).unwrap();
        let handle = RawMonitorHandle::from_raw(monitor.index());

        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();
        assert_eq!(table.enter(handle, &thread), Err(ThreadError::InvalidMonitor));
        assert_eq!(table.destroy(handle), Err(ThreadError::InvalidMonitor));
        registry.detach(&thread);
    }

    #[test]
    fn destroy_force_releases_owner() {
        let (table, registry) = table(16);
        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();

        let handle = table.create("held").unwrap();
        table.enter(handle, &thread).unwrap();
        table.enter(handle, &thread).unwrap();
        assert_eq!(table.owner(handle), Ok(Some(thread.id())));
        assert_eq!(thread.owned_monitors(), vec![MonitorRef::Raw(handle)]);

        table.destroy(handle).unwrap();
        assert!(thread.owned_monitors().is_empty());
        assert_eq!(table.exit(handle, &thread), Err(ThreadError::InvalidMonitor));
        assert_eq!(
            table.wait(handle, &thread, Some(Duration::ZERO)),
            Err(ThreadError::InvalidMonitor)
        );

        registry.detach(&thread);
    }

    #[test]
    fn notify_requires_ownership() {
        let (table, registry) = table(16);
        let thread = registry.attach("main", false, MockRuntime::new()).unwrap();
        let handle = table.create("m").unwrap();

        assert_eq!(
            table.notify(handle, &thread),
            Err(ThreadError::IllegalMonitorState)
        );
        table.enter(handle, &thread).unwrap();
        assert_eq!(table.notify(handle, &thread), Ok(()));
        assert_eq!(table.notify_all(handle, &thread), Ok(()));
        assert_eq!(
            table.wait(handle, &thread, Some(Duration::ZERO)),
            Ok(WaitResult::TimedOut)
        );
        table.exit(handle, &thread).unwrap();

        registry.detach(&thread);
    }
}
