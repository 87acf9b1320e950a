//! The replicator: protocol state, monitors and the controllers driving
//! state transfer on both ends.
//!
//! Joiner-side logic lives in `joiner`, donor-side logic in `donor`,
//! the receive loop and applier pool in `runtime`. Everything operates
//! on one shared [`Replicator`] value, mirroring the fact that a node
//! can change roles between views but never holds two roles at once.

mod donor;
mod joiner;
mod runtime;

pub use joiner::{TransferError, Unrecoverable};

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use uuid::Uuid;

use crate::cache::WritesetCache;
use crate::config::Config;
use crate::core::{
    Gtid, InvalidTransition, NodeState, SEQNO_UNDEFINED, Seqno, StateMachine, ViewInfo, WriteSet,
};
use crate::group::{Group, GroupError};
use crate::ist::{IstBus, IstReceiver, IstSenders};
use crate::monitor::Monitor;
use crate::safety::{SafetyError, SafetyFile};
use crate::sst::{SstDonor, SstHandshake, StateProvider};

/// What kind of transfer last completed on this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateTransferKind {
    Sst,
    Ist,
}

/// Host-provided collaborators.
pub struct Services {
    pub group: Arc<dyn Group>,
    pub applier: Arc<dyn Applier>,
    pub sst_donor: Arc<dyn SstDonor>,
    pub state_provider: Arc<dyn StateProvider>,
    pub ist_bus: Arc<IstBus>,
}

/// Applies admitted write-sets. Implementations run on applier-pool
/// threads and on the joiner thread during incremental replay.
pub trait Applier: Send + Sync {
    fn apply(&self, ws: &WriteSet) -> Result<(), ApplyError>;

    /// Commit hook, entered under the commit monitor when commit
    /// ordering is on.
    fn commit(&self, _ws: &WriteSet) -> Result<(), ApplyError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("apply failed at seqno {seqno}: {reason}")]
pub struct ApplyError {
    pub seqno: Seqno,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    State(#[from] InvalidTransition),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error("{op} is not valid in state {state}")]
    BadState { op: &'static str, state: NodeState },
}

pub struct Replicator {
    pub(crate) config: Config,
    pub(crate) state: StateMachine,
    pub(crate) state_uuid: Mutex<Uuid>,
    pub(crate) safe_to_bootstrap: AtomicBool,
    /// Seqno of the latest configuration change. A donation streams up
    /// to this point, which may be past the seqno in the request if
    /// views changed in between.
    pub(crate) cc_seqno: AtomicI64,
    pub(crate) local_monitor: Monitor,
    pub(crate) apply_monitor: Monitor,
    pub(crate) commit_monitor: Monitor,
    pub(crate) safety: SafetyFile,
    pub(crate) cache: Arc<WritesetCache>,
    pub(crate) group: Arc<dyn Group>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) sst_donor: Arc<dyn SstDonor>,
    pub(crate) state_provider: Arc<dyn StateProvider>,
    pub(crate) sst: SstHandshake,
    pub(crate) ist_bus: Arc<IstBus>,
    pub(crate) ist_receiver: IstReceiver,
    pub(crate) ist_prepared: AtomicBool,
    pub(crate) ist_senders: IstSenders,
    transfer_history: Mutex<Vec<StateTransferKind>>,
    closed: AtomicBool,
    joiner_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    /// Build a replicator positioned from the persistent safety marker.
    /// An unsafe or corrupt marker yields an undefined position: the
    /// data cannot be trusted, so the next membership round will demand
    /// a full snapshot.
    pub fn new(config: Config, services: Services) -> Result<Arc<Self>, ReplicatorError> {
        let safety = SafetyFile::open(&config.safety_path)?;
        let marker = safety.get();

        let (uuid, seqno) = if marker.safe && !marker.corrupt {
            (marker.uuid, marker.seqno)
        } else {
            tracing::warn!(
                "stored state {}:{} is unsafe, full state transfer will be required",
                marker.uuid,
                marker.seqno
            );
            (Uuid::nil(), SEQNO_UNDEFINED)
        };
        tracing::info!("recovered position {uuid}:{seqno}");

        let local_monitor = Monitor::new("local", config.monitor_depth);
        let apply_monitor = Monitor::new("apply", config.monitor_depth);
        let commit_monitor = Monitor::new("commit", config.monitor_depth);
        local_monitor.set_position(0);
        apply_monitor.set_position(seqno);
        commit_monitor.set_position(seqno);

        let ist_receiver = IstReceiver::new(Arc::clone(&services.ist_bus), &config.node_name);

        Ok(Arc::new(Self {
            state: StateMachine::new(NodeState::NonPrimary),
            state_uuid: Mutex::new(uuid),
            safe_to_bootstrap: AtomicBool::new(marker.safe_to_bootstrap),
            cc_seqno: AtomicI64::new(SEQNO_UNDEFINED),
            local_monitor,
            apply_monitor,
            commit_monitor,
            safety,
            cache: Arc::new(WritesetCache::new(uuid)),
            group: services.group,
            applier: services.applier,
            sst_donor: services.sst_donor,
            state_provider: services.state_provider,
            sst: SstHandshake::new(),
            ist_bus: services.ist_bus,
            ist_receiver,
            ist_prepared: AtomicBool::new(false),
            ist_senders: IstSenders::new(),
            transfer_history: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            joiner_thread: Mutex::new(None),
            config,
        }))
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn state_uuid(&self) -> Uuid {
        *self.state_uuid.lock().expect("state uuid lock")
    }

    /// The applied position: everything at or below has been applied.
    pub fn state_seqno(&self) -> Seqno {
        self.apply_monitor.last_left()
    }

    pub fn gtid(&self) -> Gtid {
        Gtid::new(self.state_uuid(), self.state_seqno())
    }

    pub fn cache(&self) -> &Arc<WritesetCache> {
        &self.cache
    }

    pub fn transfer_history(&self) -> Vec<StateTransferKind> {
        self.transfer_history.lock().expect("history lock").clone()
    }

    pub fn last_transfer(&self) -> Option<StateTransferKind> {
        self.transfer_history
            .lock()
            .expect("history lock")
            .last()
            .copied()
    }

    pub(crate) fn record_transfer(&self, kind: StateTransferKind) {
        self.transfer_history.lock().expect("history lock").push(kind);
    }

    pub(crate) fn set_state_uuid(&self, uuid: Uuid) {
        *self.state_uuid.lock().expect("state uuid lock") = uuid;
    }

    pub(crate) fn safe_to_bootstrap(&self) -> bool {
        self.safe_to_bootstrap.load(Ordering::Relaxed)
    }

    /// A view with a state gap requires a transfer unless the gap is in
    /// seqno only and already covered locally.
    pub fn state_transfer_required(&self, view: &ViewInfo) -> bool {
        if !view.state_gap {
            return false;
        }
        if self.state_uuid() == view.state_id.uuid {
            // Common history: a transfer is needed only if we are short.
            return self.state_seqno() < view.state_id.seqno;
        }
        true
    }

    /// Process a configuration change. Detecting a state gap spawns the
    /// joiner thread; the receive loop stays free for ordered traffic.
    pub fn process_view(self: &Arc<Self>, view: ViewInfo) -> Result<(), ReplicatorError> {
        tracing::info!(
            "view {} ({:?}): group state {}, {} member(s)",
            view.view_id,
            view.status,
            view.state_id,
            view.members.len()
        );

        if !view.is_primary() {
            self.state.shift_to(NodeState::NonPrimary)?;
            return Ok(());
        }

        self.cc_seqno.store(view.state_id.seqno, Ordering::SeqCst);
        if self.state() == NodeState::NonPrimary {
            self.state.shift_to(NodeState::Primary)?;
        }

        if self.state_transfer_required(&view) {
            tracing::info!(
                "state gap: local {} vs group {}",
                self.gtid(),
                view.state_id
            );
            let repl = Arc::clone(self);
            let handle = std::thread::spawn(move || {
                let request = repl.state_provider.sst_request();
                match repl.request_state_transfer(view.state_id.uuid, view.state_id.seqno, request)
                {
                    Ok(gtid) => tracing::info!("state transfer complete: {gtid}"),
                    Err(err) => {
                        tracing::error!("state transfer failed, node restart required: {err}");
                    }
                }
            });
            *self.joiner_thread.lock().expect("joiner thread lock") = Some(handle);
        }
        // Without a gap the node stays in PRIMARY; the group concludes
        // membership and delivers the join action itself.
        Ok(())
    }

    /// Transfer concluded group-wide: joiners and donors return to
    /// `Joined`. A joiner stays put on a failed status; its joiner
    /// thread surfaces the failure.
    pub fn process_joined(&self, status: i64) -> Result<(), ReplicatorError> {
        match self.state() {
            NodeState::Donor => {
                if status < 0 {
                    tracing::warn!("donation finished with status {status}");
                }
                self.state.shift_to(NodeState::Joined)?;
            }
            NodeState::Joiner | NodeState::Primary if status >= 0 => {
                self.state.shift_to(NodeState::Joined)?;
            }
            state => {
                tracing::debug!("join action (status {status}) ignored in state {state}");
            }
        }
        Ok(())
    }

    /// Flow control reports this node caught up with the group.
    pub fn process_synced(&self) -> Result<(), ReplicatorError> {
        if self.state() == NodeState::Joined {
            self.state.shift_to(NodeState::Synced)?;
            tracing::info!("synced with group at {}", self.gtid());
        }
        Ok(())
    }

    /// Idempotent shutdown: the second caller observes "already closed"
    /// and returns without error.
    pub fn close(&self, explicit: bool) -> Result<(), ReplicatorError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("close: already closed");
            return Ok(());
        }
        tracing::info!("closing replicator (explicit: {explicit})");
        // Mid-transfer states go down through Closing as well.
        let _ = self.state.shift_to(NodeState::Closing);
        self.group.close(explicit);
        self.ist_senders.join_all();
        let _ = self.state.shift_to(NodeState::Closed);
        Ok(())
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run a write-set through the ordered apply (and commit) gates.
    /// Shared between the applier pool and incremental replay.
    pub(crate) fn apply_writeset(&self, ws: &WriteSet) -> Result<(), ApplyError> {
        if ws.is_noop() {
            self.apply_monitor.self_cancel(ws.seqno_g);
            if self.config.commit_ordered() {
                self.commit_monitor.self_cancel(ws.seqno_g);
            }
            return Ok(());
        }

        self.apply_monitor.enter(ws.seqno_g);
        let applied = self.applier.apply(ws);
        self.apply_monitor.leave(ws.seqno_g);
        applied?;

        if self.config.commit_ordered() {
            self.commit_monitor.enter(ws.seqno_g);
            let committed = self.applier.commit(ws);
            self.commit_monitor.leave(ws.seqno_g);
            committed?;
        }

        self.group.set_last_applied(self.apply_monitor.last_left());
        Ok(())
    }

    /// Join the joiner thread if one ran; used by hosts on shutdown.
    pub fn wait_for_joiner(&self) {
        let handle = self.joiner_thread.lock().expect("joiner thread lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::core::ViewStatus;
    use crate::test_support::{ClosureDonor, RecordingApplier, ScriptedGroup, StaticProvider};

    fn replicator(position: Option<(Uuid, Seqno)>) -> (Arc<Replicator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let safety_path = dir.path().join("state.json");
        if let Some((uuid, seqno)) = position {
            let file = SafetyFile::open(&safety_path).unwrap();
            file.set(uuid, seqno, false).unwrap();
        }
        let config = Config {
            safety_path,
            ..Config::default()
        };
        let services = Services {
            group: Arc::new(ScriptedGroup::new()),
            applier: Arc::new(RecordingApplier::new()),
            sst_donor: Arc::new(ClosureDonor::unreachable()),
            state_provider: Arc::new(StaticProvider(Bytes::new())),
            ist_bus: Arc::new(IstBus::new("unit")),
        };
        (Replicator::new(config, services).unwrap(), dir)
    }

    fn view(state_id: Gtid, state_gap: bool) -> ViewInfo {
        ViewInfo {
            view_id: 1,
            status: ViewStatus::Primary,
            state_id,
            state_gap,
            members: vec!["a".to_string()],
            my_index: 0,
        }
    }

    #[test]
    fn transfer_required_compares_seqnos_on_common_history() {
        let uuid = Uuid::new_v4();
        let (repl, _dir) = replicator(Some((uuid, 100)));
        assert!(!repl.state_transfer_required(&view(Gtid::new(uuid, 150), false)));
        assert!(repl.state_transfer_required(&view(Gtid::new(uuid, 150), true)));
        assert!(!repl.state_transfer_required(&view(Gtid::new(uuid, 100), true)));
        assert!(repl.state_transfer_required(&view(Gtid::new(Uuid::new_v4(), 10), true)));
    }

    #[test]
    fn unsafe_marker_degrades_position_to_undefined() {
        let dir = TempDir::new().unwrap();
        let safety_path = dir.path().join("state.json");
        let uuid = Uuid::new_v4();
        {
            let file = SafetyFile::open(&safety_path).unwrap();
            file.set(uuid, 42, true).unwrap();
            file.mark_unsafe().unwrap();
        }
        let config = Config {
            safety_path,
            ..Config::default()
        };
        let services = Services {
            group: Arc::new(ScriptedGroup::new()),
            applier: Arc::new(RecordingApplier::new()),
            sst_donor: Arc::new(ClosureDonor::unreachable()),
            state_provider: Arc::new(StaticProvider(Bytes::new())),
            ist_bus: Arc::new(IstBus::new("unit")),
        };
        let repl = Replicator::new(config, services).unwrap();
        assert!(repl.state_uuid().is_nil());
        assert_eq!(repl.state_seqno(), SEQNO_UNDEFINED);
        // safe_to_bootstrap survives independently of the safe flag.
        assert!(repl.safe_to_bootstrap());
    }

    #[test]
    fn noop_writesets_cancel_their_slots() {
        let uuid = Uuid::new_v4();
        let (repl, _dir) = replicator(Some((uuid, 100)));
        let noop = WriteSet::new(101, 1, SEQNO_UNDEFINED, Bytes::new());
        repl.apply_writeset(&noop).unwrap();
        // The cancelled slot counts as complete for drains.
        repl.apply_monitor.drain(101);
        repl.commit_monitor.drain(101);
        assert_eq!(repl.state_seqno(), 101);
    }

    #[test]
    fn close_is_idempotent() {
        let (repl, _dir) = replicator(None);
        repl.close(true).unwrap();
        repl.close(false).unwrap();
        assert_eq!(repl.state(), NodeState::Closed);
    }

    #[test]
    fn joined_and_synced_follow_the_transfer() {
        let uuid = Uuid::new_v4();
        let (repl, _dir) = replicator(Some((uuid, 100)));
        repl.process_view(view(Gtid::new(uuid, 100), false)).unwrap();
        assert_eq!(repl.state(), NodeState::Primary);
        repl.process_joined(100).unwrap();
        assert_eq!(repl.state(), NodeState::Joined);
        repl.process_synced().unwrap();
        assert_eq!(repl.state(), NodeState::Synced);
    }
}
