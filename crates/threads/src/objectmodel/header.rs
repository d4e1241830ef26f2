use std::{fmt, ops::Deref};

use crate::{objectmodel::SyncObject, sync::lock_word::LockWordCell};

/// Object header holding the lock word. Embed it in objects that need an
/// intrinsic monitor.
#[derive(Default)]
pub struct ObjectHeader {
    lock: LockWordCell,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            lock: LockWordCell::new(),
        }
    }

    pub fn lock_word(&self) -> &LockWordCell {
        &self.lock
    }
}

impl SyncObject for ObjectHeader {
    fn lock_word(&self) -> &LockWordCell {
        &self.lock
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("lock", &self.lock.load())
            .finish()
    }
}

/// A value with a header in front, usable wherever an object monitor is needed.
pub struct Synchronized<T> {
    header: ObjectHeader,
    value: T,
}

impl<T> Synchronized<T> {
    pub const fn new(value: T) -> Self {
        Self {
            header: ObjectHeader::new(),
            value,
        }
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Send + Sync + 'static> SyncObject for Synchronized<T> {
    fn lock_word(&self) -> &LockWordCell {
        self.header.lock_word()
    }
}

impl<T> Deref for Synchronized<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::objectmodel::ObjectRef;

    #[test]
    fn object_identity() {
        let a = Arc::new(Synchronized::new(1u32));
        let b = Arc::new(Synchronized::new(1u32));

        let ra = ObjectRef::from(a.clone());
        assert_eq!(ra, ObjectRef::from(a.clone()));
        assert_ne!(ra, ObjectRef::from(b));
        assert!(ra.lock_word().load().is_free());
        assert_eq!(**a, 1);
    }
}
