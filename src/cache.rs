//! In-memory write-set cache shared by appliers, donors and senders.
//!
//! Donation reserves a range with `seqno_lock(start)`: everything from
//! `start` onward is pinned against purging until the returned guard is
//! dropped. The guard is a value and moves with the work, typically into
//! the sender thread that streams the range.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

use crate::core::{Seqno, WriteSet};

#[derive(Debug, Error)]
pub enum CacheError {
    /// `start` is not in cache (purged, or past the tail). The caller
    /// decides whether a snapshot fallback exists.
    #[error("seqno {seqno} not found in write-set cache")]
    NotFoundInCache { seqno: Seqno },
    #[error("write-set cache already locked from {locked_from}")]
    Busy { locked_from: Seqno },
}

#[derive(Debug)]
pub struct WritesetCache {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    uuid: Uuid,
    entries: BTreeMap<Seqno, WriteSet>,
    locked_from: Option<Seqno>,
}

impl WritesetCache {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            inner: Mutex::new(Inner {
                uuid,
                entries: BTreeMap::new(),
                locked_from: None,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.lock().uuid
    }

    pub fn insert(&self, ws: WriteSet) {
        self.lock().entries.insert(ws.seqno_g, ws);
    }

    pub fn get(&self, seqno: Seqno) -> Option<WriteSet> {
        self.lock().entries.get(&seqno).cloned()
    }

    pub fn first_seqno(&self) -> Option<Seqno> {
        self.lock().entries.keys().next().copied()
    }

    pub fn last_seqno(&self) -> Option<Seqno> {
        self.lock().entries.keys().next_back().copied()
    }

    /// Drop history at or below `seqno`, honoring an active range lock.
    pub fn purge_up_to(&self, seqno: Seqno) {
        let mut inner = self.lock();
        let horizon = match inner.locked_from {
            Some(locked_from) => seqno.min(locked_from - 1),
            None => seqno,
        };
        inner.entries = inner.entries.split_off(&(horizon + 1));
    }

    /// Re-seat the cache at a new position, clearing all history. Used
    /// while joining, when the group state replaces the local one.
    pub fn reset(&self, uuid: Uuid, seqno: Seqno) {
        let mut inner = self.lock();
        tracing::debug!("write-set cache reset to {uuid}:{seqno}");
        inner.uuid = uuid;
        inner.entries.clear();
        inner.locked_from = None;
    }

    /// Reserve `[start, ..]` against purging. `start` must currently be
    /// in cache.
    pub fn seqno_lock(self: &Arc<Self>, start: Seqno) -> Result<SeqnoGuard, CacheError> {
        let mut inner = self.lock();
        if let Some(locked_from) = inner.locked_from {
            return Err(CacheError::Busy { locked_from });
        }
        let in_cache = inner.entries.contains_key(&start);
        if !in_cache {
            return Err(CacheError::NotFoundInCache { seqno: start });
        }
        inner.locked_from = Some(start);
        Ok(SeqnoGuard {
            cache: Arc::clone(self),
            start,
        })
    }

    fn seqno_unlock(&self) {
        self.lock().locked_from = None;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("write-set cache lock")
    }
}

/// Scoped range reservation. Dropping it releases the lock on every exit
/// path; move it into the task that finishes the range.
#[derive(Debug)]
pub struct SeqnoGuard {
    cache: Arc<WritesetCache>,
    start: Seqno,
}

impl SeqnoGuard {
    pub fn start(&self) -> Seqno {
        self.start
    }
}

impl Drop for SeqnoGuard {
    fn drop(&mut self) {
        self.cache.seqno_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cache_with_range(first: Seqno, last: Seqno) -> Arc<WritesetCache> {
        let cache = Arc::new(WritesetCache::new(Uuid::new_v4()));
        for seqno in first..=last {
            cache.insert(WriteSet::new(seqno, seqno, seqno - 1, Bytes::from_static(b"w")));
        }
        cache
    }

    #[test]
    fn lock_requires_start_in_cache() {
        let cache = cache_with_range(120, 150);
        let err = cache.seqno_lock(101).unwrap_err();
        assert!(matches!(err, CacheError::NotFoundInCache { seqno: 101 }));
        let err = cache.seqno_lock(151).unwrap_err();
        assert!(matches!(err, CacheError::NotFoundInCache { seqno: 151 }));
        assert!(cache.seqno_lock(120).is_ok());
    }

    #[test]
    fn second_lock_is_busy_until_guard_drops() {
        let cache = cache_with_range(1, 10);
        let guard = cache.seqno_lock(5).unwrap();
        assert!(matches!(
            cache.seqno_lock(6),
            Err(CacheError::Busy { locked_from: 5 })
        ));
        drop(guard);
        assert!(cache.seqno_lock(6).is_ok());
    }

    #[test]
    fn guard_moves_across_threads() {
        let cache = cache_with_range(1, 10);
        let guard = cache.seqno_lock(3).unwrap();
        let handle = std::thread::spawn(move || guard.start());
        assert_eq!(handle.join().unwrap(), 3);
        assert!(cache.seqno_lock(3).is_ok());
    }

    #[test]
    fn purge_respects_lock() {
        let cache = cache_with_range(1, 10);
        let guard = cache.seqno_lock(5).unwrap();
        cache.purge_up_to(8);
        assert_eq!(cache.first_seqno(), Some(5));
        drop(guard);
        cache.purge_up_to(8);
        assert_eq!(cache.first_seqno(), Some(9));
    }

    #[test]
    fn reset_clears_history() {
        let cache = cache_with_range(1, 10);
        let uuid = Uuid::new_v4();
        cache.reset(uuid, 50);
        assert_eq!(cache.uuid(), uuid);
        assert_eq!(cache.first_seqno(), None);
    }
}
