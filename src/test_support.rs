//! In-memory collaborators for tests and demos.
//!
//! Nothing here touches a network: the group is scripted, donation is a
//! closure, the applier records what it saw. Integration tests wire two
//! replicators together by forwarding captured requests into the peer's
//! donor path and sharing one ist bus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use uuid::Uuid;

use crate::core::{Gtid, Seqno, WriteSet};
use crate::group::{Action, Group, GroupError, StrRejected, StrTicket};
use crate::replicator::{Applier, ApplyError};
use crate::sst::{SstDonor, SstError, StateProvider};

/// Everything the group layer saw about one state-transfer request.
#[derive(Clone, Debug)]
pub struct CapturedStr {
    pub version: u8,
    pub request: Vec<u8>,
    pub donor_hint: String,
    pub ist_uuid: Uuid,
    pub ist_seqno: Seqno,
    pub local_seqno: Seqno,
}

type StrForward = Box<dyn Fn(&CapturedStr) + Send + Sync>;

/// Group fake: scripted request replies, recorded joins, an action
/// queue for the receive loop.
pub struct ScriptedGroup {
    replies: Mutex<VecDeque<Result<i64, GroupError>>>,
    requests: Mutex<Vec<CapturedStr>>,
    forward: Mutex<Option<StrForward>>,
    joins: Mutex<Vec<i64>>,
    last_applied: AtomicI64,
    next_local: AtomicI64,
    actions_tx: Sender<Action>,
    actions_rx: Receiver<Action>,
    closed: AtomicBool,
}

impl ScriptedGroup {
    pub fn new() -> Self {
        let (actions_tx, actions_rx) = unbounded();
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            forward: Mutex::new(None),
            joins: Mutex::new(Vec::new()),
            last_applied: AtomicI64::new(-1),
            next_local: AtomicI64::new(1),
            actions_tx,
            actions_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue the donor index (`Ok`) or error for the next request.
    /// Without a script every request succeeds with donor 0.
    pub fn script_reply(&self, reply: Result<i64, GroupError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Run `forward` on every captured request, after the capture. Used
    /// to hand the bytes to a peer's donor path.
    pub fn on_request(&self, forward: impl Fn(&CapturedStr) + Send + Sync + 'static) {
        *self.forward.lock().unwrap() = Some(Box::new(forward));
    }

    pub fn push_action(&self, action: Action) {
        self.actions_tx.send(action).unwrap();
    }

    pub fn requests(&self) -> Vec<CapturedStr> {
        self.requests.lock().unwrap().clone()
    }

    pub fn joins(&self) -> Vec<i64> {
        self.joins.lock().unwrap().clone()
    }

    pub fn last_applied(&self) -> Seqno {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Group for ScriptedGroup {
    fn request_state_transfer(
        &self,
        version: u8,
        request: &[u8],
        donor_hint: &str,
        ist_uuid: Uuid,
        ist_seqno: Seqno,
    ) -> Result<StrTicket, StrRejected> {
        let local_seqno = self.next_local.fetch_add(1, Ordering::SeqCst);
        let captured = CapturedStr {
            version,
            request: request.to_vec(),
            donor_hint: donor_hint.to_string(),
            ist_uuid,
            ist_seqno,
            local_seqno,
        };
        self.requests.lock().unwrap().push(captured.clone());

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(0));
        match reply {
            Ok(donor_index) => {
                if let Some(forward) = self.forward.lock().unwrap().as_ref() {
                    forward(&captured);
                }
                Ok(StrTicket {
                    donor_index,
                    local_seqno,
                })
            }
            Err(error) => Err(StrRejected { error, local_seqno }),
        }
    }

    fn join(&self, status: i64) -> Result<(), GroupError> {
        self.joins.lock().unwrap().push(status);
        Ok(())
    }

    fn set_last_applied(&self, seqno: Seqno) {
        self.last_applied.store(seqno, Ordering::SeqCst);
    }

    fn close(&self, _explicit: bool) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn recv(&self) -> Result<Action, GroupError> {
        // Poll so a concurrent close() can wake the receive loop.
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(GroupError::Closed);
            }
            match self
                .actions_rx
                .recv_timeout(std::time::Duration::from_millis(10))
            {
                Ok(action) => return Ok(action),
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    return Err(GroupError::Closed);
                }
            }
        }
    }

    fn state_seqno(&self, _uuid: &Uuid) -> Option<Seqno> {
        None
    }
}

/// Applier recording applied and committed seqnos.
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<Seqno>>,
    committed: Mutex<Vec<Seqno>>,
    fail_at: Mutex<Option<Seqno>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, seqno: Seqno) {
        *self.fail_at.lock().unwrap() = Some(seqno);
    }

    pub fn applied(&self) -> Vec<Seqno> {
        self.applied.lock().unwrap().clone()
    }

    pub fn committed(&self) -> Vec<Seqno> {
        self.committed.lock().unwrap().clone()
    }
}

impl Applier for RecordingApplier {
    fn apply(&self, ws: &WriteSet) -> Result<(), ApplyError> {
        if *self.fail_at.lock().unwrap() == Some(ws.seqno_g) {
            return Err(ApplyError {
                seqno: ws.seqno_g,
                reason: "injected failure".to_string(),
            });
        }
        self.applied.lock().unwrap().push(ws.seqno_g);
        Ok(())
    }

    fn commit(&self, ws: &WriteSet) -> Result<(), ApplyError> {
        self.committed.lock().unwrap().push(ws.seqno_g);
        Ok(())
    }
}

type DonateFn = Box<dyn Fn(&[u8], Gtid, bool) -> Result<(), SstError> + Send + Sync>;

/// Donation callback backed by a closure; records every invocation.
pub struct ClosureDonor {
    donate: DonateFn,
    calls: Mutex<Vec<(Gtid, bool)>>,
}

impl ClosureDonor {
    pub fn new(
        donate: impl Fn(&[u8], Gtid, bool) -> Result<(), SstError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            donate: Box::new(donate),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A donor that should never be asked to donate.
    pub fn unreachable() -> Self {
        Self::new(|_, state_id, _| {
            panic!("unexpected donation towards {state_id}");
        })
    }

    pub fn calls(&self) -> Vec<(Gtid, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

impl SstDonor for ClosureDonor {
    fn donate(&self, request: &[u8], state_id: Gtid, bypass: bool) -> Result<(), SstError> {
        self.calls.lock().unwrap().push((state_id, bypass));
        (self.donate)(request, state_id, bypass)
    }
}

/// Fixed snapshot-request payload.
pub struct StaticProvider(pub Bytes);

impl StateProvider for StaticProvider {
    fn sst_request(&self) -> Bytes {
        self.0.clone()
    }
}
