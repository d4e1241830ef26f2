//! Test doubles for embedders and for the crate's own tests.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    objectmodel::{header::Synchronized, ObjectRef},
    runtime::{threads::ThreadRecord, SafepointPollable},
    utils::epoch_millis,
};

/// Engine that counts the callbacks it receives and has a settable clock.
#[derive(Default, Debug)]
pub struct MockRuntime {
    polls: AtomicUsize,
    interrupts: AtomicUsize,
    /// Zero means "use the system clock".
    time_millis: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn delivered_interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn set_time_millis(&self, millis: u64) {
        self.time_millis.store(millis, Ordering::SeqCst);
    }
}

impl SafepointPollable for MockRuntime {
    fn at_safepoint(&self, _thread: &ThreadRecord) {
        self.polls.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver_interrupt(&self, _thread: &ThreadRecord) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn current_time_millis(&self) -> u64 {
        match self.time_millis.load(Ordering::SeqCst) {
            0 => epoch_millis(),
            millis => millis,
        }
    }
}

/// Object with nothing but a header.
pub struct MockObject;

impl MockObject {
    pub fn new_ref() -> ObjectRef {
        ObjectRef::from(Arc::new(Synchronized::new(())))
    }
}
