//! Handle identities and explicit reference counts.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a runtime object.
///
/// This is the value reported when a handle is returned through an info
/// query. Zero is never issued and stands for "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Issues a fresh identity.
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Decodes a handle identity written by an info query.
    #[must_use]
    pub fn from_ne_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_ne_bytes(bytes))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Atomic explicit reference count.
///
/// Objects start with one reference. Reaching zero is observed by exactly one
/// caller of [`release`](RefCount::release), which then owns teardown.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicU32,
}

impl RefCount {
    /// Creates a count holding one reference.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(1),
        }
    }

    /// Current count.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true once the last reference was released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.get() == 0
    }

    /// Adds a reference. Fails if the object was already released.
    pub fn retain(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference.
    ///
    /// Returns `Some(true)` for the caller that released the last reference,
    /// `Some(false)` for other releases and `None` if the count was already
    /// zero.
    pub fn release(&self) -> Option<bool> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current == 1),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_handle_ids_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert_ne!(a.raw(), 0);
        assert_eq!(HandleId::from_ne_bytes(a.raw().to_ne_bytes()), a);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let count = RefCount::new();
        assert_eq!(count.get(), 1);
        assert!(count.retain());
        assert_eq!(count.get(), 2);
        assert_eq!(count.release(), Some(false));
        assert_eq!(count.release(), Some(true));
        assert!(count.is_released());
        assert_eq!(count.release(), None);
        assert!(!count.retain());
    }

    #[test]
    fn test_refcount_concurrent_single_teardown() {
        let count = Arc::new(RefCount::new());
        for _ in 0..63 {
            assert!(count.retain());
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let count = Arc::clone(&count);
                thread::spawn(move || {
                    (0..8)
                        .filter(|_| count.release() == Some(true))
                        .count()
                })
            })
            .collect();

        let teardowns: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(teardowns, 1);
        assert!(count.is_released());
    }
}
