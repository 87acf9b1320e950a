//! Donor-side incremental stream workers.
//!
//! Each donation runs one sender thread. The thread owns the cache
//! range guard for its lifetime: the donor hands the guard over at
//! launch and the range stays pinned until the stream (and the thread)
//! is done.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::cache::{SeqnoGuard, WritesetCache};
use crate::core::Seqno;

use super::{IstBus, IstError, IstMessage};

pub struct IstSenders {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IstSenders {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launch a sender for `[first, last]` towards `peer`. On success
    /// `guard` moves into the sender thread; on failure it is dropped
    /// here, releasing the range.
    pub fn run(
        &self,
        bus: &Arc<IstBus>,
        peer: &str,
        cache: Arc<WritesetCache>,
        guard: SeqnoGuard,
        first: Seqno,
        last: Seqno,
    ) -> Result<(), IstError> {
        if first > last {
            return Err(IstError::BadRange { first, last });
        }
        debug_assert_eq!(guard.start(), first);
        let tx = bus.connect(peer)?;

        let peer = peer.to_string();
        let handle = thread::spawn(move || {
            let _guard = guard;
            let mut sent_up_to = first - 1;
            for seqno in first..=last {
                let Some(ws) = cache.get(seqno) else {
                    tracing::error!(
                        "write-set {seqno} missing from locked cache range, \
                         ending ist stream to {peer} early"
                    );
                    break;
                };
                if tx.send(IstMessage::WriteSet(ws)).is_err() {
                    tracing::warn!("ist peer {peer} went away at seqno {seqno}");
                    return;
                }
                sent_up_to = seqno;
            }
            let _ = tx.send(IstMessage::Eof { last: sent_up_to });
            tracing::info!("ist sender finished range [{first}, {sent_up_to}] to {peer}");
        });
        self.handles.lock().expect("ist senders lock").push(handle);
        Ok(())
    }

    /// Wait for every active sender to finish. Used on close.
    pub fn join_all(&self) {
        let handles: Vec<_> = self.handles.lock().expect("ist senders lock").drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for IstSenders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    use crate::core::WriteSet;
    use crate::ist::IstReceiver;

    fn seeded_cache(first: Seqno, last: Seqno) -> Arc<WritesetCache> {
        let cache = Arc::new(WritesetCache::new(Uuid::new_v4()));
        for seqno in first..=last {
            cache.insert(WriteSet::new(seqno, seqno, seqno - 1, Bytes::from_static(b"w")));
        }
        cache
    }

    #[test]
    fn streams_locked_range_and_releases_lock() {
        let bus = Arc::new(IstBus::new("test"));
        let cache = seeded_cache(101, 150);
        let receiver = IstReceiver::new(Arc::clone(&bus), "joiner");
        let addr = receiver.prepare(101, 150).unwrap();
        receiver.ready();

        let senders = IstSenders::new();
        let guard = cache.seqno_lock(101).unwrap();
        senders.run(&bus, &addr, Arc::clone(&cache), guard, 101, 150).unwrap();

        let mut got = Vec::new();
        while let Some(ws) = receiver.recv().unwrap() {
            got.push(ws.seqno_g);
        }
        assert_eq!(got, (101..=150).collect::<Vec<_>>());
        assert_eq!(receiver.finished(), 150);

        senders.join_all();
        // Guard travelled with the thread and is released by now.
        assert!(cache.seqno_lock(101).is_ok());
    }

    #[test]
    fn unknown_peer_fails_and_releases_guard() {
        let bus = Arc::new(IstBus::new("test"));
        let cache = seeded_cache(1, 5);
        let senders = IstSenders::new();
        let guard = cache.seqno_lock(1).unwrap();
        let err = senders
            .run(&bus, "ist://test/nowhere/9", Arc::clone(&cache), guard, 1, 5)
            .unwrap_err();
        assert!(matches!(err, IstError::PeerNotFound { .. }));
        assert!(cache.seqno_lock(1).is_ok());
    }

    #[test]
    fn empty_range_is_rejected() {
        let bus = Arc::new(IstBus::new("test"));
        let cache = seeded_cache(1, 5);
        let senders = IstSenders::new();
        let guard = cache.seqno_lock(1).unwrap();
        assert!(matches!(
            senders.run(&bus, "anywhere", Arc::clone(&cache), guard, 5, 1),
            Err(IstError::BadRange { .. })
        ));
    }
}
