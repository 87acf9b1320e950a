//! Donor-side state transfer.
//!
//! A state request arrives as one action in the totally-ordered stream.
//! The donor serializes on the local monitor, drains the apply (and
//! commit) monitors so the visible snapshot corresponds exactly to the
//! delivery seqno, then picks between incremental-only, incremental
//! with snapshot bypass, full snapshot, or nothing at all.

use crate::cache::CacheError;
use crate::core::{Errno, Gtid, NodeState, Seqno};
use crate::proto::{self, IstRequest, StateRequest};
use crate::sst::{self, STATE_TRANSFER_NONE};

use super::{Replicator, ReplicatorError};

use std::sync::atomic::Ordering;

impl Replicator {
    /// Handle a delivered state request. `local_seqno` is the slot the
    /// request took in the local order, `donor_seqno` the last globally
    /// ordered seqno at delivery.
    pub fn process_state_request(
        &self,
        request: &[u8],
        local_seqno: Seqno,
        donor_seqno: Seqno,
        requestor: &str,
    ) -> Result<(), ReplicatorError> {
        debug_assert!(local_seqno > -1);

        self.local_monitor.enter(local_seqno);
        self.apply_monitor.drain(donor_seqno);
        if self.config.commit_ordered() {
            self.commit_monitor.drain(donor_seqno);
        }

        if let Err(err) = self.state.shift_to(NodeState::Donor) {
            tracing::error!("cannot donate state transfer for {requestor}: {err}");
            self.local_monitor.leave(local_seqno);
            self.group.join(Errno::Perm.status())?;
            return Err(err.into());
        }

        let streq = match proto::parse(request) {
            Ok(streq) => streq,
            Err(err) => {
                // Treat garbage as an empty request: the joiner gets a
                // cancellation instead of silence.
                tracing::warn!("malformed state request from {requestor}: {err}");
                StateRequest::V0 {
                    sst: bytes::Bytes::new(),
                }
            }
        };

        let rcode = self.serve_state_request(&streq, donor_seqno, requestor);

        self.local_monitor.leave(local_seqno);

        match rcode {
            Donation::Complete(status) => self.group.join(status)?,
            Donation::DeferredToSst => {}
        }
        Ok(())
    }

    fn serve_state_request(
        &self,
        streq: &StateRequest,
        donor_seqno: Seqno,
        requestor: &str,
    ) -> Donation {
        // First NUL-terminated string of the snapshot section, for the
        // legacy "none" spelling of the trivial request.
        let sst_head = streq
            .sst()
            .split(|byte| *byte == 0)
            .next()
            .map(|head| String::from_utf8_lossy(head).into_owned())
            .unwrap_or_default();

        if sst::is_trivial(streq.sst()) || sst_head == STATE_TRANSFER_NONE {
            tracing::info!("{requestor} needs no state transfer, joining immediately");
            return Donation::Complete(donor_seqno);
        }

        if streq.has_ist() {
            match IstRequest::parse(streq.ist()) {
                Ok(istr) if istr.uuid == self.state_uuid() => {
                    return self.serve_incremental(streq, &istr, donor_seqno, requestor);
                }
                Ok(istr) => {
                    tracing::info!(
                        "incremental request for foreign state {} (local {}), \
                         serving full snapshot",
                        istr.uuid,
                        self.state_uuid()
                    );
                }
                Err(err) => {
                    tracing::warn!("malformed incremental descriptor from {requestor}: {err}");
                }
            }
        }

        self.serve_snapshot(streq, donor_seqno)
    }

    /// The joiner shares our history: try to stream from cache, falling
    /// back to a full snapshot when the range start is gone.
    fn serve_incremental(
        &self,
        streq: &StateRequest,
        istr: &IstRequest,
        donor_seqno: Seqno,
        requestor: &str,
    ) -> Donation {
        tracing::info!("incremental request from {requestor}: {istr}");
        let first = istr.last_applied + 1;

        let guard = match self.cache.seqno_lock(first) {
            Ok(guard) => guard,
            Err(CacheError::NotFoundInCache { .. }) => {
                tracing::info!(
                    "incremental start {first} not found in cache, \
                     falling back to snapshot"
                );
                if streq.sst().is_empty() {
                    // The donor moved on and the joiner prepared no
                    // fallback; it has to restart and re-request.
                    tracing::info!(
                        "incremental transfer canceled: donor seqno moved forward \
                         and no snapshot request was prepared by {requestor}"
                    );
                    return Donation::Complete(Errno::NoData.status());
                }
                return self.serve_snapshot(streq, donor_seqno);
            }
            Err(err @ CacheError::Busy { .. }) => {
                tracing::error!("cannot reserve cache range for {requestor}: {err}");
                return Donation::Complete(Errno::Again.status());
            }
        };

        let mut deferred = false;
        if !streq.sst().is_empty() {
            // The joiner parks on the snapshot handshake even though no
            // bytes will move; tell it its state id via the callback.
            let state_id = Gtid::new(istr.uuid, istr.last_applied);
            let status = self.donate_sst(streq.sst(), state_id, true);
            if status < 0 {
                tracing::error!("failed to bypass snapshot for {requestor}");
                return Donation::Complete(status);
            }
            deferred = true;
        }

        // Stream up to the latest configuration change, which may be
        // past the seqno in the descriptor if views changed since the
        // joiner sent it.
        let last = self.cc_seqno.load(Ordering::SeqCst).max(istr.group_seqno);
        match self.ist_senders.run(
            &self.ist_bus,
            &istr.peer,
            self.cache.clone(),
            guard,
            first,
            last,
        ) {
            Ok(()) => {
                if deferred {
                    Donation::DeferredToSst
                } else {
                    Donation::Complete(donor_seqno)
                }
            }
            Err(err) => {
                tracing::error!("incremental transfer to {requestor} failed: {err}");
                Donation::Complete(err.errno().status())
            }
        }
    }

    fn serve_snapshot(&self, streq: &StateRequest, donor_seqno: Seqno) -> Donation {
        if streq.sst().is_empty() {
            tracing::warn!("snapshot request is null, transfer canceled");
            return Donation::Complete(Errno::Canceled.status());
        }
        let state_id = Gtid::new(self.state_uuid(), donor_seqno);
        let status = self.donate_sst(streq.sst(), state_id, false);
        if status < 0 {
            Donation::Complete(status)
        } else {
            Donation::DeferredToSst
        }
    }

    /// Invoke the host donation callback. Any failure surfaces to the
    /// joiner as a cancellation.
    fn donate_sst(&self, request: &[u8], state_id: Gtid, bypass: bool) -> i64 {
        match self.sst_donor.donate(request, state_id, bypass) {
            Ok(()) => state_id.seqno,
            Err(err) => {
                tracing::error!(
                    "snapshot donation {}failed: {err}",
                    if bypass { "bypass " } else { "" }
                );
                Errno::Canceled.status()
            }
        }
    }

    /// Donor-side snapshot completion, called by the host when the
    /// donation thread finishes. Performs the join deferred by the
    /// donation paths above.
    pub fn sst_sent(&self, state_id: Gtid, rcode: i64) -> Result<(), ReplicatorError> {
        let state = self.state();
        if state != NodeState::Donor {
            tracing::error!("snapshot-sent notification in state {state}");
            return Err(ReplicatorError::BadState {
                op: "sst_sent",
                state,
            });
        }
        if rcode >= 0 {
            tracing::info!("snapshot sent: {state_id}");
        } else {
            tracing::error!("snapshot sending failed: {rcode}");
        }
        let status = if rcode < 0 { rcode } else { state_id.seqno };
        self.group.join(status)?;
        Ok(())
    }
}

/// How a served request concludes: immediately with a status, or later
/// through `sst_sent` once the donation thread reports back.
enum Donation {
    Complete(i64),
    DeferredToSst,
}
