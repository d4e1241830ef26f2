//! Monitor deadlock detection.
//!
//! Walks the wait-for graph "thread blocks entering monitor, monitor is owned
//! by thread". The graph is read without a global lock while threads keep
//! running, so the answer is a best-effort snapshot.

use std::sync::Arc;

use crate::{
    runtime::{
        registry::ThreadRegistry,
        threads::{ThreadId, ThreadRecord},
    },
    sync::{lock_word::LockWord, monitor_table::MonitorTable, MonitorRef},
};

/// One edge of a deadlock cycle: `thread` blocks entering `monitor`, which is
/// owned by the thread of the next edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleEdge {
    pub thread: ThreadId,
    pub monitor: MonitorRef,
}

pub struct DeadlockDetector {
    registry: Arc<ThreadRegistry>,
    table: Arc<MonitorTable>,
}

impl DeadlockDetector {
    pub fn new(registry: Arc<ThreadRegistry>, table: Arc<MonitorTable>) -> Self {
        Self { registry, table }
    }

    /// Current owner of `monitor`.
    pub fn owner_of(&self, monitor: &MonitorRef) -> Option<ThreadId> {
        match monitor {
            MonitorRef::Object(object) => match object.lock_word().load() {
                LockWord::Free => None,
                LockWord::Thin { owner, .. } => Some(owner),
                LockWord::Inflated { index } => self.table.get(index)?.owner_id(),
            },
            MonitorRef::Raw(handle) => self.table.owner(*handle).ok().flatten(),
        }
    }

    fn blocked_on(&self, thread: &ThreadRecord) -> Option<(MonitorRef, ThreadId)> {
        let monitor = thread.contended_monitor()?;
        let owner = self.owner_of(&monitor)?;
        Some((monitor, owner))
    }

    /// Every cycle reachable from `threads`, each listed once and rotated so
    /// it starts at its smallest thread id.
    pub fn find_cycles(&self, threads: &[ThreadId]) -> Vec<Vec<CycleEdge>> {
        let mut cycles: Vec<Vec<CycleEdge>> = Vec::new();
        let mut path: Vec<CycleEdge> = Vec::new();

        for &start in threads {
            path.clear();
            let mut current = start;

            loop {
                if let Some(pos) = path.iter().position(|edge| edge.thread == current) {
                    let mut cycle = path[pos..].to_vec();
                    let min = cycle
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, edge)| edge.thread)
                        .map(|(ix, _)| ix)
                        .unwrap_or(0);
                    cycle.rotate_left(min);

                    if !cycles.contains(&cycle) {
                        cycles.push(cycle);
                    }
                    break;
                }

                if cycles
                    .iter()
                    .any(|cycle| cycle.iter().any(|edge| edge.thread == current))
                {
                    break;
                }

                let Some(record) = self.registry.get(current) else {
                    break;
                };

                let Some((monitor, owner)) = self.blocked_on(&record) else {
                    break;
                };

                path.push(CycleEdge {
                    thread: current,
                    monitor,
                });
                current = owner;
            }
        }

        cycles
    }

    /// Threads on a deadlock cycle reachable from `threads`, deduplicated and
    /// sorted by id. Threads merely blocked behind a cycle are not reported.
    pub fn find_deadlocked(&self, threads: &[ThreadId]) -> Vec<ThreadId> {
        let mut out = self
            .find_cycles(threads)
            .into_iter()
            .flatten()
            .map(|edge| edge.thread)
            .collect::<Vec<_>>();
        out.sort();
        out.dedup();
        out
    }

    /// [`find_deadlocked`](Self::find_deadlocked) over every attached thread.
    pub fn find_all_deadlocked(&self) -> Vec<ThreadId> {
        let ids = self
            .registry
            .threads()
            .iter()
            .map(|thread| thread.id())
            .collect::<Vec<_>>();
        self.find_deadlocked(&ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockObject, MockRuntime},
        options::ThreadingOptions,
        sync::{monitor_table::RawMonitorHandle, object_monitor::ObjectSynchronizer},
    };

    struct Fixture {
        registry: Arc<ThreadRegistry>,
        table: Arc<MonitorTable>,
        sync: Arc<ObjectSynchronizer>,
        detector: DeadlockDetector,
        runtime: Arc<MockRuntime>,
    }

    fn fixture() -> Fixture {
        let options = ThreadingOptions::default();
        let table = Arc::new(MonitorTable::new(&options));
        let registry = Arc::new(ThreadRegistry::new(table.clone()));
        Fixture {
            sync: Arc::new(ObjectSynchronizer::new(
                table.clone(),
                registry.clone(),
                &options,
            )),
            detector: DeadlockDetector::new(registry.clone(), table.clone()),
            registry,
            table,
            runtime: MockRuntime::new(),
        }
    }

    #[test]
    fn two_thread_cycle() {
        let f = fixture();
        let a = MockObject::new_ref();
        let b = MockObject::new_ref();
        let (tx, rx) = flume::unbounded();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        // each thread takes one lock and then blocks forever on the other
        for (first, second) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            let registry = f.registry.clone();
            let sync = f.sync.clone();
            let runtime = f.runtime.clone();
            let tx = tx.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("deadlocked", true, runtime).unwrap();
                sync.enter(&first, &thread).unwrap();
                tx.send(thread.id()).unwrap();
                barrier.wait();
                let _ = sync.enter(&second, &thread);
            });
        }

        let t1 = rx.recv().unwrap();
        let t2 = rx.recv().unwrap();

        let mut expected = vec![t1, t2];
        expected.sort();
        loop {
            let found = f.detector.find_deadlocked(&[t1, t2]);
            if found == expected {
                break;
            }
            std::thread::yield_now();
        }

        let cycles = f.detector.find_cycles(&[t1, t2]);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
        assert_eq!(cycles[0][0].thread, expected[0]);
        assert_eq!(f.detector.find_all_deadlocked(), expected);
    }

    #[test]
    fn chain_is_not_a_deadlock() {
        let f = fixture();
        let handle = f.table.create("chain").unwrap();
        let owner = f.registry.attach("owner", false, f.runtime.clone()).unwrap();
        f.table.enter(handle, &owner).unwrap();

        let (tx, rx) = flume::bounded(1);
        let blocked = {
            let registry = f.registry.clone();
            let table = f.table.clone();
            let runtime = f.runtime.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("blocked", false, runtime).unwrap();
                tx.send(thread.clone()).unwrap();
                table.enter(handle, &thread).unwrap();
                table.exit(handle, &thread).unwrap();
                registry.detach(&thread);
            })
        };

        let waiter = rx.recv().unwrap();
        while waiter.contended_monitor().is_none() {
            std::thread::yield_now();
        }
        assert_eq!(
            f.detector.owner_of(&MonitorRef::Raw(handle)),
            Some(owner.id())
        );
        assert!(f
            .detector
            .find_deadlocked(&[waiter.id(), owner.id()])
            .is_empty());

        f.table.exit(handle, &owner).unwrap();
        blocked.join().unwrap();
        f.registry.detach(&owner);
    }

    #[test]
    fn deep_chain_is_not_a_deadlock() {
        let f = fixture();
        let m1 = f.table.create("m1").unwrap();
        let m2 = f.table.create("m2").unwrap();
        let m3 = f.table.create("m3").unwrap();
        let owner = f.registry.attach("owner", false, f.runtime.clone()).unwrap();
        f.table.enter(m1, &owner).unwrap();

        let spawn_link = |hold: RawMonitorHandle, want: RawMonitorHandle| {
            let registry = f.registry.clone();
            let table = f.table.clone();
            let runtime = f.runtime.clone();
            let (tx, rx) = flume::bounded(1);
            let handle = std::thread::spawn(move || {
                let thread = registry.attach("link", false, runtime).unwrap();
                table.enter(hold, &thread).unwrap();
                tx.send(thread.clone()).unwrap();
                table.enter(want, &thread).unwrap();
                table.exit(want, &thread).unwrap();
                table.exit(hold, &thread).unwrap();
                registry.detach(&thread);
            });

            let thread = rx.recv().unwrap();
            while thread.contended_monitor().is_none() {
                std::thread::yield_now();
            }
            (thread, handle)
        };

        // third -> m2 (second) -> m1 (owner), owner runs
        let (second, second_handle) = spawn_link(m2, m1);
        let (third, third_handle) = spawn_link(m3, m2);
        let ids = [third.id(), second.id(), owner.id()];

        assert_eq!(
            f.detector.owner_of(&MonitorRef::Raw(m2)),
            Some(second.id())
        );
        assert!(f.detector.find_cycles(&ids).is_empty());
        assert!(f.detector.find_deadlocked(&ids).is_empty());
        assert!(f.detector.find_all_deadlocked().is_empty());

        f.table.exit(m1, &owner).unwrap();
        second_handle.join().unwrap();
        third_handle.join().unwrap();
        f.registry.detach(&owner);
    }

    #[test]
    fn thread_behind_a_cycle_is_not_on_it() {
        let f = fixture();
        let a = f.table.create("a").unwrap();
        let b = f.table.create("b").unwrap();
        let (tx, rx) = flume::unbounded();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        // these threads never finish
        for (hold, want) in [(a, b), (b, a)] {
            let registry = f.registry.clone();
            let table = f.table.clone();
            let runtime = f.runtime.clone();
            let tx = tx.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("deadlocked", true, runtime).unwrap();
                table.enter(hold, &thread).unwrap();
                tx.send(thread.id()).unwrap();
                barrier.wait();
                let _ = table.enter(want, &thread);
            });
        }

        let mut cycle = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        cycle.sort();

        let (lead_tx, lead_rx) = flume::bounded(1);
        {
            let registry = f.registry.clone();
            let table = f.table.clone();
            let runtime = f.runtime.clone();
            std::thread::spawn(move || {
                let thread = registry.attach("lead-in", true, runtime).unwrap();
                lead_tx.send(thread.clone()).unwrap();
                let _ = table.enter(a, &thread);
            });
        }
        let lead = lead_rx.recv().unwrap();
        while lead.contended_monitor().is_none() {
            std::thread::yield_now();
        }

        let all = [lead.id(), cycle[0], cycle[1]];
        while f.detector.find_deadlocked(&all) != cycle {
            std::thread::yield_now();
        }

        // starting from the lead-in still finds the cycle, without it
        assert_eq!(f.detector.find_deadlocked(&[lead.id()]), cycle);
        let cycles = f.detector.find_cycles(&all);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
        assert_eq!(cycles[0][0].thread, cycle[0]);
        assert!(cycles[0].iter().all(|edge| edge.thread != lead.id()));
        assert_eq!(f.detector.find_all_deadlocked(), cycle);
    }
}
