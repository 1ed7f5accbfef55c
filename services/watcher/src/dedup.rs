//! Bounded in-memory set of already-seen event ids.
//!
//! This sits in front of the store's unique constraint to skip redundant
//! inserts. It survives reconnects (one instance per process) but not
//! restarts; after a restart the store alone guarantees uniqueness.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Inner {
    seen: HashSet<i64>,
    order: VecDeque<i64>,
}

pub struct EidCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EidCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Mark `eid` as seen. Returns `true` if it was not seen before.
    ///
    /// When the cache grows past capacity the oldest fifth of the entries
    /// (at least one) is dropped.
    pub fn check_and_mark(&self, eid: i64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.seen.insert(eid) {
            return false;
        }
        inner.order.push_back(eid);

        if inner.seen.len() > self.capacity {
            let evict = (self.capacity / 5).max(1);
            for _ in 0..evict {
                let Some(old) = inner.order.pop_front() else {
                    break;
                };
                inner.seen.remove(&old);
            }
        }
        true
    }

    /// Un-mark an id, e.g. after its insert failed so a redelivery retries.
    pub fn forget(&self, eid: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.seen.remove(&eid) {
            inner.order.retain(|e| *e != eid);
        }
    }

    pub fn contains(&self, eid: i64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .contains(&eid)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EidCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
