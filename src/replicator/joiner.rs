//! Joiner-side state transfer.
//!
//! The joiner builds a state request (preparing an incremental receiver
//! when the gap is seqno-only), marks the safety file unsafe before a
//! snapshot can start mutating data, emits the request with bounded-
//! interval retries, parks on the snapshot handshake, installs the
//! received position and finally replays the incremental range.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    Errno, Gtid, NodeState, SEQNO_UNDEFINED, Seqno, WriteSetState,
};
use crate::group::StrTicket;
use crate::ist::IstError;
use crate::proto::{self, IstRequest};
use crate::safety::SafetyError;
use crate::sst::{self, SstState};

use super::{Replicator, ReplicatorError, StateTransferKind};

/// Conditions that end a state transfer without a new state.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The snapshot was cancelled from the receiving side.
    #[error("state transfer canceled")]
    Canceled,
    /// The request failed while the node was shutting down; expected.
    #[error("state transfer request interrupted by shutdown: {errno}")]
    Interrupted { errno: Errno },
    /// The node cannot continue; the host must restart the process.
    #[error(transparent)]
    Unrecoverable(#[from] Unrecoverable),
    #[error(transparent)]
    Safety(#[from] SafetyError),
}

#[derive(Debug, Error)]
pub enum Unrecoverable {
    #[error(
        "donor seqno moved past the requested incremental range and no snapshot \
         fallback was prepared; restart required"
    )]
    DonorRangeAdvanced,
    #[error("received state {received} does not match group state {required}; restart required")]
    WrongUuid { received: Gtid, required: Uuid },
    #[error(
        "local ordering queue overflowed while requesting state transfer; \
         make sure at least one group member is fully synced; restart required"
    )]
    MonitorOverflow,
    #[error("state request preparation failed: {reason}")]
    Prepare { reason: String },
    #[error("state transfer request failed unrecoverably: {errno}; restart required")]
    RequestFailed { errno: Errno },
    #[error("incremental replay failed at seqno {seqno}: {reason}; restart required")]
    IstApply { seqno: Seqno, reason: String },
}

impl TransferError {
    pub fn errno(&self) -> Errno {
        match self {
            TransferError::Canceled => Errno::Canceled,
            TransferError::Interrupted { errno } => *errno,
            TransferError::Unrecoverable(err) => match err {
                Unrecoverable::DonorRangeAdvanced => Errno::NoData,
                Unrecoverable::WrongUuid { .. } => Errno::Perm,
                Unrecoverable::MonitorOverflow => Errno::Deadlock,
                Unrecoverable::Prepare { .. } => Errno::Inval,
                Unrecoverable::RequestFailed { errno } => *errno,
                Unrecoverable::IstApply { .. } => Errno::Inval,
            },
            TransferError::Safety(_) => Errno::Inval,
        }
    }
}

#[derive(Debug, Error)]
enum IstPrepareError {
    #[error("local state uuid {local} does not match group state uuid {group}")]
    UuidMismatch { local: Uuid, group: Uuid },
    #[error("local state seqno is undefined")]
    SeqnoUndefined,
    #[error(transparent)]
    Receiver(#[from] IstError),
}

impl Replicator {
    /// Bind the incremental receiver and produce the descriptor
    /// advertising it. Only a seqno-only gap qualifies.
    fn prepare_for_ist(
        &self,
        group_uuid: Uuid,
        group_seqno: Seqno,
    ) -> Result<IstRequest, IstPrepareError> {
        let local_uuid = self.state_uuid();
        if local_uuid != group_uuid {
            return Err(IstPrepareError::UuidMismatch {
                local: local_uuid,
                group: group_uuid,
            });
        }
        let local_seqno = self.state_seqno();
        if local_seqno < 0 {
            return Err(IstPrepareError::SeqnoUndefined);
        }
        debug_assert!(local_seqno < group_seqno);

        let recv_addr = self.ist_receiver.prepare(local_seqno + 1, group_seqno)?;
        self.ist_prepared.store(true, Ordering::SeqCst);

        Ok(IstRequest::new(recv_addr, local_uuid, local_seqno, group_seqno))
    }

    /// Encode the state request for the configured protocol version,
    /// attaching an incremental descriptor when the gap allows one.
    fn prepare_state_request(
        &self,
        sst_request: &[u8],
        group_uuid: Uuid,
        group_seqno: Seqno,
    ) -> Result<(Bytes, Option<IstRequest>), Unrecoverable> {
        match self.config.str_proto_ver {
            0 => Ok((proto::encode_v0(sst_request), None)),
            1 | 2 => {
                let ist = match self.prepare_for_ist(group_uuid, group_seqno) {
                    Ok(ist) => Some(ist),
                    Err(err) => {
                        tracing::info!(
                            "state gap cannot be serviced incrementally, \
                             falling back to snapshot: {err}"
                        );
                        None
                    }
                };
                if ist.is_some() {
                    tracing::info!(
                        "state gap can likely be serviced incrementally; \
                         snapshot request kept as fallback"
                    );
                }
                let ist_bytes = ist.as_ref().map(IstRequest::to_bytes).unwrap_or_default();
                match proto::encode_v1(sst_request, &ist_bytes) {
                    Ok(bytes) => Ok((bytes, ist)),
                    Err(err) => {
                        self.teardown_ist();
                        Err(Unrecoverable::Prepare {
                            reason: err.to_string(),
                        })
                    }
                }
            }
            version => Err(Unrecoverable::Prepare {
                reason: format!("unsupported state request protocol version {version}"),
            }),
        }
    }

    /// Emit the request. Transient group errors retry forever at the
    /// configured interval; everything else resolves here.
    fn send_state_request(
        &self,
        request: &[u8],
        ist: Option<&IstRequest>,
        unsafe_marked: bool,
    ) -> Result<StrTicket, TransferError> {
        let (ist_uuid, ist_seqno) = match ist {
            Some(ist) => (ist.uuid, ist.last_applied),
            None => (Uuid::nil(), SEQNO_UNDEFINED),
        };

        let mut tries = 0u64;
        loop {
            tries += 1;
            let rejection = match self.group.request_state_transfer(
                self.config.str_proto_ver,
                request,
                &self.config.donor_hint,
                ist_uuid,
                ist_seqno,
            ) {
                Ok(ticket) => {
                    if self.local_monitor.would_block(ticket.local_seqno) {
                        return self.fail_send(Errno::Deadlock, unsafe_marked, tries);
                    }
                    // The request holds its slot in the local order only
                    // on the donor; locally it is a no-op.
                    self.local_monitor.self_cancel(ticket.local_seqno);
                    if tries == 1 {
                        tracing::info!(
                            "requesting state transfer: success, donor {}",
                            ticket.donor_index
                        );
                    } else {
                        tracing::info!(
                            "requesting state transfer: success after {tries} tries, donor {}",
                            ticket.donor_index
                        );
                    }
                    return Ok(ticket);
                }
                Err(rejection) => rejection,
            };

            if rejection.local_seqno != SEQNO_UNDEFINED {
                if self.local_monitor.would_block(rejection.local_seqno) {
                    return self.fail_send(Errno::Deadlock, unsafe_marked, tries);
                }
                self.local_monitor.self_cancel(rejection.local_seqno);
            }

            match rejection.error {
                crate::group::GroupError::NoData => {
                    // The group state ran past our incremental range and
                    // we prepared no snapshot fallback. Preserve the
                    // current position for the retry after restart.
                    if unsafe_marked {
                        self.safety.mark_safe()?;
                    }
                    tracing::error!(
                        "state transfer request failed: donor seqno went forward \
                         during incremental negotiation and no snapshot request \
                         was prepared; restart required"
                    );
                    return Err(Unrecoverable::DonorRangeAdvanced.into());
                }
                ref err if err.is_transient() => {
                    if tries == 1 {
                        tracing::info!(
                            "requesting state transfer failed: {err}, \
                             retrying every {}ms",
                            self.config.sst_retry_ms
                        );
                    }
                    std::thread::sleep(self.config.retry_interval());
                }
                ref err => {
                    tracing::error!("requesting state transfer failed: {err}");
                    return self.fail_send(err.errno(), unsafe_marked, tries);
                }
            }
        }
    }

    /// Common tail for non-transient send failures: persist the current
    /// position, then either abort-worthy error or expected shutdown.
    fn fail_send(
        &self,
        errno: Errno,
        unsafe_marked: bool,
        tries: u64,
    ) -> Result<StrTicket, TransferError> {
        if errno == Errno::Deadlock {
            tracing::error!(
                "slave queue grew too long while requesting state transfer \
                 {tries} time(s); make sure at least one fully synced member \
                 is in the group"
            );
        }
        {
            let mut shared = self.sst.lock();
            shared.state = SstState::ReqFailed;
        }
        self.safety
            .set(self.state_uuid(), self.state_seqno(), self.safe_to_bootstrap())?;

        if self.is_closing() {
            // Send failure while closing is expected; restore the safe
            // flag the request flipped.
            if unsafe_marked {
                self.safety.mark_safe()?;
            }
            return Err(TransferError::Interrupted { errno });
        }

        if !unsafe_marked {
            // Force a snapshot on restart: this position may already be
            // stale relative to what the group negotiated.
            self.safety.mark_unsafe()?;
        }
        if errno == Errno::Deadlock {
            Err(Unrecoverable::MonitorOverflow.into())
        } else {
            Err(Unrecoverable::RequestFailed { errno }.into())
        }
    }

    /// Full joiner-side protocol. Returns the installed state on
    /// success. Unrecoverable errors mean the host must restart the
    /// process; the safety marker is already positioned for that.
    pub fn request_state_transfer(
        &self,
        group_uuid: Uuid,
        group_seqno: Seqno,
        sst_request: Bytes,
    ) -> Result<Gtid, TransferError> {
        let trivial = sst::is_trivial(&sst_request);
        let (request_bytes, ist) =
            self.prepare_state_request(&sst_request, group_uuid, group_seqno)?;

        // A non-trivial snapshot will mutate local data with no further
        // notification; the unsafe mark must be durable before the
        // request leaves this node.
        let unsafe_marked = !sst_request.is_empty() && !trivial;
        {
            let mut shared = self.sst.lock();
            if unsafe_marked {
                self.safety.mark_unsafe()?;
            }
            shared.state = SstState::Wait;
        }

        if let Err(err) = self.send_state_request(&request_bytes, ist.as_ref(), unsafe_marked) {
            self.teardown_ist();
            return Err(err);
        }

        if let Err(err) = self.state.shift_to(NodeState::Joiner) {
            self.teardown_ist();
            return Err(Unrecoverable::Prepare {
                reason: err.to_string(),
            }
            .into());
        }

        // Waiting for the transfer is a good moment to re-seat the
        // cache; the old history is for a state we are replacing.
        self.cache.reset(group_uuid, group_seqno);

        if !sst_request.is_empty() {
            if trivial {
                let mut shared = self.sst.lock();
                shared.uuid = group_uuid;
                shared.seqno = group_seqno;
                shared.state = SstState::Received;
            } else {
                let mut shared = self.sst.lock();
                while shared.state == SstState::Wait {
                    shared = self.sst.wait(shared);
                }
            }

            let (state, sst_uuid, sst_seqno) = {
                let shared = self.sst.lock();
                (shared.state, shared.uuid, shared.seqno)
            };

            if state == SstState::Canceled {
                // New snapshot required after restart.
                if !unsafe_marked {
                    self.safety.mark_unsafe()?;
                }
                self.teardown_ist();
                let _ = self.close(false);
                return Err(TransferError::Canceled);
            }

            if sst_uuid != group_uuid {
                tracing::error!(
                    "application received wrong state: received {sst_uuid}, \
                     required {group_uuid}"
                );
                {
                    let mut shared = self.sst.lock();
                    shared.state = SstState::Failed;
                }
                self.safety
                    .set(sst_uuid, sst_seqno, self.safe_to_bootstrap())?;
                if unsafe_marked {
                    self.safety.mark_safe()?;
                }
                self.teardown_ist();
                return Err(Unrecoverable::WrongUuid {
                    received: Gtid::new(sst_uuid, sst_seqno),
                    required: group_uuid,
                }
                .into());
            }

            // Install the snapshot position so a post-snapshot
            // incremental phase starts from the right place.
            self.set_state_uuid(sst_uuid);
            self.apply_monitor.set_position(sst_seqno);
            if self.config.commit_ordered() {
                self.commit_monitor.set_position(sst_seqno);
            }
            self.record_transfer(StateTransferKind::Sst);
            tracing::debug!("installed new state {sst_uuid}:{sst_seqno}");
        } else {
            debug_assert_eq!(self.state_uuid(), group_uuid);
        }

        // Keep the stored seqno undefined until the transfer fully
        // completes; a kill during incremental replay must not recover
        // to a concrete position.
        self.safety
            .set(self.state_uuid(), SEQNO_UNDEFINED, self.safe_to_bootstrap())?;
        if unsafe_marked {
            self.safety.mark_safe()?;
        }

        if ist.is_some() {
            let sst_ok = self.sst.lock().state.allows_ist();
            if sst_ok && self.state() == NodeState::Joiner && self.state_seqno() < group_seqno {
                tracing::info!(
                    "receiving incremental transfer: {} write-set(s), seqnos {}-{group_seqno}",
                    group_seqno - self.state_seqno(),
                    self.state_seqno() + 1
                );
                self.ist_receiver.ready();
                let replayed = self.recv_ist();
                let last = self.teardown_ist().unwrap_or(SEQNO_UNDEFINED);
                replayed?;
                self.record_transfer(StateTransferKind::Ist);
                // Appliers launched by the replay must settle before
                // ordinary traffic resumes behind them.
                self.apply_monitor.drain(last);
                tracing::info!("incremental transfer received: {}:{last}", self.state_uuid());
            } else {
                self.teardown_ist();
            }
        }

        // Back to the steady-state marker: uuid only, seqno undefined.
        let marker = self.safety.get();
        if marker.seqno != SEQNO_UNDEFINED {
            self.safety
                .set(marker.uuid, SEQNO_UNDEFINED, marker.safe_to_bootstrap)?;
        }

        Ok(self.gtid())
    }

    /// Replay loop: pull one write-set at a time, run it through the
    /// ordered gates, stop at end of range.
    fn recv_ist(&self) -> Result<(), TransferError> {
        let mut first = true;
        loop {
            let ws = match self.ist_receiver.recv() {
                Ok(Some(ws)) => ws,
                Ok(None) => return Ok(()),
                Err(err) => {
                    return Err(Unrecoverable::IstApply {
                        seqno: self.state_seqno() + 1,
                        reason: err.to_string(),
                    }
                    .into());
                }
            };

            if first {
                first = false;
                // A concrete stored seqno is a lie from here on: the
                // first applied write-set makes it stale.
                let marker = self.safety.get();
                if marker.seqno != SEQNO_UNDEFINED {
                    self.safety
                        .set(marker.uuid, SEQNO_UNDEFINED, marker.safe_to_bootstrap)?;
                }
            }

            if let Err(err) = ws.verify_checksum() {
                return Err(Unrecoverable::IstApply {
                    seqno: ws.seqno_g,
                    reason: err.to_string(),
                }
                .into());
            }

            if ws.is_noop() {
                self.apply_monitor.self_cancel(ws.seqno_g);
                if self.config.commit_ordered() {
                    self.commit_monitor.self_cancel(ws.seqno_g);
                }
                continue;
            }

            // Replication and certification already happened on the
            // donor; re-enter the pipeline at the certified stage.
            let mut ws = ws;
            ws.set_state(WriteSetState::Certifying);
            if let Err(err) = self.apply_writeset(&ws) {
                self.safety.mark_corrupt()?;
                return Err(Unrecoverable::IstApply {
                    seqno: ws.seqno_g,
                    reason: err.to_string(),
                }
                .into());
            }
        }
    }

    /// Close the incremental receiver if it was prepared; returns the
    /// last seqno it took.
    fn teardown_ist(&self) -> Option<Seqno> {
        if self.ist_prepared.swap(false, Ordering::SeqCst) {
            Some(self.ist_receiver.finished())
        } else {
            None
        }
    }

    /// Joiner-side snapshot completion, called by the host's receive
    /// callback. Valid while joining, or just before the shift when the
    /// acknowledgment races the request (the node is still `Primary`).
    pub fn sst_received(&self, state_id: Gtid, rcode: i64) -> Result<(), ReplicatorError> {
        if rcode == Errno::Canceled.status() {
            tracing::info!("snapshot request was cancelled");
        } else {
            tracing::info!("snapshot received: {state_id}");
        }
        debug_assert!(rcode <= 0);

        {
            let mut shared = self.sst.lock();
            shared.uuid = state_id.uuid;
            shared.seqno = if rcode == 0 { state_id.seqno } else { SEQNO_UNDEFINED };
            shared.state = if rcode == Errno::Canceled.status() {
                SstState::Canceled
            } else {
                // Any other failure parks an undefined position; the
                // joiner surfaces it as a state mismatch.
                SstState::Received
            };
            self.sst.signal();
        }

        // Check the state only after signalling, or a mistimed call
        // would leave the joiner waiting forever.
        match self.state() {
            NodeState::Joiner | NodeState::Primary => Ok(()),
            state => {
                tracing::error!("snapshot completion delivered in state {state}");
                Err(ReplicatorError::BadState {
                    op: "sst_received",
                    state,
                })
            }
        }
    }
}
