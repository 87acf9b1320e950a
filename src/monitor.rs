//! Ordered admission gates.
//!
//! A monitor admits slots keyed by a strictly increasing seqno: a slot
//! enters only once every lower key has entered or been cancelled, so
//! concurrent workers observe apply/commit effects in total order. The
//! local, apply and commit monitors all share this shape; they differ
//! only in what the admitted slot then does.
//!
//! A monitor has no failures of its own. Failures belong to the work
//! executed inside a slot.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::core::{SEQNO_UNDEFINED, Seqno};

pub struct Monitor {
    name: &'static str,
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    /// Highest key admitted (or absorbed as cancelled).
    last_entered: Seqno,
    /// Highest key for which everything at or below has left.
    last_left: Seqno,
    /// Keys that left out of order, above `last_left`.
    finished: BTreeSet<Seqno>,
    /// Cancelled keys not yet reached by `last_entered`.
    cancelled: BTreeSet<Seqno>,
    /// While a drain is active, keys above the target are held back.
    drain_target: Option<Seqno>,
    /// Admission-depth budget for `would_block`.
    depth: i64,
}

impl Inner {
    /// Absorb contiguous cancelled keys into the entered range, then
    /// advance `last_left` over contiguous finished keys.
    fn settle(&mut self) {
        while self.cancelled.remove(&(self.last_entered + 1)) {
            self.last_entered += 1;
            self.finished.insert(self.last_entered);
        }
        while self.finished.remove(&(self.last_left + 1)) {
            self.last_left += 1;
        }
    }
}

impl Monitor {
    pub fn new(name: &'static str, depth: i64) -> Self {
        assert!(depth > 0, "monitor depth must be positive");
        Self {
            name,
            inner: Mutex::new(Inner {
                last_entered: SEQNO_UNDEFINED,
                last_left: SEQNO_UNDEFINED,
                finished: BTreeSet::new(),
                cancelled: BTreeSet::new(),
                drain_target: None,
                depth,
            }),
            cond: Condvar::new(),
        }
    }

    /// Install a position. All bookkeeping is reset; the next admissible
    /// key is `seqno + 1`.
    pub fn set_position(&self, seqno: Seqno) {
        let mut inner = self.lock();
        tracing::debug!("{} monitor position set to {seqno}", self.name);
        inner.last_entered = seqno;
        inner.last_left = seqno;
        inner.finished.clear();
        inner.cancelled.clear();
        inner.drain_target = None;
        self.cond.notify_all();
    }

    /// Block until every key below `seqno` has entered or been
    /// cancelled, then take the slot.
    pub fn enter(&self, seqno: Seqno) {
        let mut inner = self.lock();
        debug_assert!(
            seqno > inner.last_left,
            "{} monitor enter({seqno}) behind position {}",
            self.name,
            inner.last_left
        );
        loop {
            let held_by_drain = matches!(inner.drain_target, Some(upto) if seqno > upto);
            if inner.last_entered + 1 == seqno && !held_by_drain {
                break;
            }
            inner = self.wait(inner);
        }
        inner.last_entered = seqno;
        inner.settle();
        self.cond.notify_all();
    }

    pub fn leave(&self, seqno: Seqno) {
        let mut inner = self.lock();
        debug_assert!(
            seqno <= inner.last_entered && seqno > inner.last_left,
            "{} monitor leave({seqno}) without matching enter",
            self.name
        );
        inner.finished.insert(seqno);
        inner.settle();
        self.cond.notify_all();
    }

    /// Mark an owned slot as never going to execute. Lower-key drains
    /// count it as complete; it never blocks admission of higher keys.
    pub fn self_cancel(&self, seqno: Seqno) {
        let mut inner = self.lock();
        if seqno <= inner.last_left {
            return;
        }
        inner.cancelled.insert(seqno);
        inner.settle();
        self.cond.notify_all();
    }

    /// Wait until every slot with key `<= upto` has left. New entries
    /// above `upto` are held back until the drain completes.
    pub fn drain(&self, upto: Seqno) {
        let mut inner = self.lock();
        while inner.drain_target.is_some() {
            inner = self.wait(inner);
        }
        if inner.last_left >= upto {
            return;
        }
        tracing::debug!("{} monitor draining up to {upto}", self.name);
        inner.drain_target = Some(upto);
        while inner.last_left < upto {
            inner = self.wait(inner);
        }
        inner.drain_target = None;
        self.cond.notify_all();
    }

    /// Backpressure predicate: admitting `seqno` would exceed the
    /// configured queue depth.
    pub fn would_block(&self, seqno: Seqno) -> bool {
        let inner = self.lock();
        seqno - inner.last_left > inner.depth
    }

    /// The position: everything at or below has been applied (or was
    /// cancelled).
    pub fn last_left(&self) -> Seqno {
        self.lock().last_left
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("monitor lock")
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cond.wait(guard).expect("monitor wait")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn position_starts_undefined() {
        let monitor = Monitor::new("test", 16);
        assert_eq!(monitor.last_left(), SEQNO_UNDEFINED);
        monitor.set_position(100);
        assert_eq!(monitor.last_left(), 100);
    }

    #[test]
    fn concurrent_enters_are_admitted_in_key_order() {
        let monitor = Arc::new(Monitor::new("test", 1024));
        monitor.set_position(0);
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (1..=16i64)
            .rev()
            .map(|seqno| {
                let monitor = Arc::clone(&monitor);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    monitor.enter(seqno);
                    admitted.lock().unwrap().push(seqno);
                    monitor.leave(seqno);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let admitted = admitted.lock().unwrap();
        assert_eq!(*admitted, (1..=16).collect::<Vec<_>>());
        assert_eq!(monitor.last_left(), 16);
    }

    #[test]
    fn self_cancel_unblocks_successor() {
        let monitor = Arc::new(Monitor::new("test", 16));
        monitor.set_position(0);

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                monitor.enter(2);
                monitor.leave(2);
            })
        };
        thread::sleep(Duration::from_millis(20));
        monitor.self_cancel(1);
        waiter.join().unwrap();
        assert_eq!(monitor.last_left(), 2);
    }

    #[test]
    fn cancel_ahead_of_entered_is_deferred() {
        let monitor = Monitor::new("test", 16);
        monitor.set_position(0);
        monitor.self_cancel(3);
        assert_eq!(monitor.last_left(), 0);

        monitor.enter(1);
        monitor.leave(1);
        monitor.self_cancel(2);
        // 2 and 3 both absorbed once the chain is contiguous.
        assert_eq!(monitor.last_left(), 3);
    }

    #[test]
    fn drain_waits_for_all_slots_at_or_below() {
        let monitor = Arc::new(Monitor::new("test", 16));
        monitor.set_position(0);
        monitor.enter(1);

        let drained = Arc::new(AtomicI64::new(0));
        let drainer = {
            let monitor = Arc::clone(&monitor);
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                monitor.drain(1);
                drained.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(drained.load(Ordering::SeqCst), 0);
        monitor.leave(1);
        drainer.join().unwrap();
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_counts_cancelled_slots_as_complete() {
        let monitor = Monitor::new("test", 16);
        monitor.set_position(10);
        monitor.self_cancel(11);
        monitor.self_cancel(12);
        monitor.drain(12);
        assert_eq!(monitor.last_left(), 12);
    }

    #[test]
    fn drain_holds_back_later_entries() {
        let monitor = Arc::new(Monitor::new("test", 16));
        monitor.set_position(0);
        monitor.enter(1);

        let drainer = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.drain(1))
        };
        thread::sleep(Duration::from_millis(20));

        let late = Arc::new(AtomicI64::new(0));
        let late_entry = {
            let monitor = Arc::clone(&monitor);
            let late = Arc::clone(&late);
            thread::spawn(move || {
                monitor.enter(2);
                late.store(1, Ordering::SeqCst);
                monitor.leave(2);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(late.load(Ordering::SeqCst), 0, "entry admitted mid-drain");

        monitor.leave(1);
        drainer.join().unwrap();
        late_entry.join().unwrap();
        assert_eq!(monitor.last_left(), 2);
    }

    #[test]
    fn would_block_reflects_depth_budget() {
        let monitor = Monitor::new("test", 4);
        monitor.set_position(0);
        assert!(!monitor.would_block(4));
        assert!(monitor.would_block(5));
        monitor.enter(1);
        monitor.leave(1);
        assert!(!monitor.would_block(5));
    }

    #[test]
    fn drain_returns_immediately_when_already_past() {
        let monitor = Monitor::new("test", 16);
        monitor.set_position(50);
        monitor.drain(40);
        monitor.drain(50);
        assert_eq!(monitor.last_left(), 50);
    }
}
