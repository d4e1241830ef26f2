use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};

use crate::sync::lock_word::LockWordCell;

pub mod header;

/// An object with an intrinsic monitor.
pub trait SyncObject: Send + Sync + 'static {
    fn lock_word(&self) -> &LockWordCell;
}

/// Shared handle to a [`SyncObject`]. Two handles are equal iff they point at
/// the same object.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn SyncObject>);

impl ObjectRef {
    pub fn new(object: Arc<dyn SyncObject>) -> Self {
        Self(object)
    }

    pub fn lock_word(&self) -> &LockWordCell {
        self.0.lock_word()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Arc::downgrade(&self.0))
    }
}

impl<T: SyncObject> From<Arc<T>> for ObjectRef {
    fn from(value: Arc<T>) -> Self {
        Self(value)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// Non-owning [`ObjectRef`]. An inflated monitor keeps one of these so its
/// slot can be reclaimed once the object is gone.
#[derive(Clone)]
pub struct WeakObjectRef(Weak<dyn SyncObject>);

impl WeakObjectRef {
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }

    fn addr(&self) -> usize {
        self.0.as_ptr() as *const () as usize
    }
}

impl PartialEq for WeakObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for WeakObjectRef {}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dead() {
            write!(f, "WeakObjectRef(dead)")
        } else {
            write!(f, "WeakObjectRef({:#x})", self.addr())
        }
    }
}
