//! Snapshot-transfer surface and joiner-side handshake.
//!
//! The snapshot bytes themselves never pass through this crate: the host
//! application moves them (rsync, backup streaming, whatever) and tells
//! us about the outcome through `sst_received`/`sst_sent`. What lives
//! here is the request sentinels, the donor callback trait and the
//! condvar handshake the joiner parks on.

use std::sync::{Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Gtid, SEQNO_UNDEFINED, Seqno};

/// Request payload of a joiner that needs group membership but no data.
pub const TRIVIAL_SST: &[u8] = b"trivial\0";

/// Legacy spelling of the same thing, still honored on the donor side.
pub const STATE_TRANSFER_NONE: &str = "none";

/// True when the request opens with the trivial sentinel (first
/// NUL-terminated string comparison, trailing bytes ignored).
pub fn is_trivial(request: &[u8]) -> bool {
    request.len() >= TRIVIAL_SST.len() && request[..TRIVIAL_SST.len()] == *TRIVIAL_SST
}

/// Donor-side callback: move a snapshot to the peer that sent `request`.
/// In bypass mode no bytes move; the callback only tells the joiner its
/// state id (the incremental stream covers the rest).
pub trait SstDonor: Send + Sync {
    fn donate(&self, request: &[u8], state_id: Gtid, bypass: bool) -> Result<(), SstError>;
}

/// Host hook producing the snapshot-request payload when this node needs
/// a state transfer. Empty means "incremental only, no fallback".
pub trait StateProvider: Send + Sync {
    fn sst_request(&self) -> Bytes;
}

#[derive(Debug, Error)]
pub enum SstError {
    #[error("snapshot donation failed with status {status}")]
    DonateFailed { status: i64 },
    #[error("snapshot transfer method unavailable: {reason}")]
    Unavailable { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SstState {
    None,
    /// Request sent, waiting for the receive callback.
    Wait,
    Received,
    Canceled,
    ReqFailed,
    Failed,
}

impl SstState {
    /// Incremental replay may only follow a snapshot phase that did not
    /// fail.
    pub fn allows_ist(self) -> bool {
        matches!(self, SstState::None | SstState::Wait | SstState::Received)
    }
}

/// Protocol state shared between the joiner thread and the receive
/// callback, guarded by the one handshake mutex.
pub struct SstShared {
    pub state: SstState,
    pub uuid: Uuid,
    pub seqno: Seqno,
}

pub struct SstHandshake {
    shared: Mutex<SstShared>,
    cond: Condvar,
}

impl SstHandshake {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(SstShared {
                state: SstState::None,
                uuid: Uuid::nil(),
                seqno: SEQNO_UNDEFINED,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SstShared> {
        self.shared.lock().expect("sst handshake lock")
    }

    pub fn wait<'a>(&self, guard: MutexGuard<'a, SstShared>) -> MutexGuard<'a, SstShared> {
        self.cond.wait(guard).expect("sst handshake wait")
    }

    pub fn signal(&self) {
        self.cond.notify_all();
    }
}

impl Default for SstHandshake {
    fn default() -> Self {
        Self::new()
    }
}
