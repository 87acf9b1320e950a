//! Contract against the group-communication layer.
//!
//! The group layer owns total ordering, membership and donor selection.
//! This crate only consumes the narrow surface below; transports and
//! quorum logic stay on the other side of the trait.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{Errno, SEQNO_UNDEFINED, Seqno, ViewInfo, WriteSet};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("group layer busy")]
    Again,
    #[error("not connected to primary component")]
    NotConnected,
    #[error("donor cannot serve the requested range")]
    NoData,
    #[error("request canceled")]
    Canceled,
    #[error("connection closed")]
    Closed,
    #[error("group layer error: {0}")]
    Other(String),
}

impl GroupError {
    pub fn errno(&self) -> Errno {
        match self {
            GroupError::Again => Errno::Again,
            GroupError::NotConnected | GroupError::Closed => Errno::NotConn,
            GroupError::NoData => Errno::NoData,
            GroupError::Canceled => Errno::Canceled,
            GroupError::Other(_) => Errno::Inval,
        }
    }

    /// Transient failures are retried by the requester.
    pub fn is_transient(&self) -> bool {
        matches!(self, GroupError::Again | GroupError::NotConnected)
    }
}

/// Successful state-transfer request: a donor was selected and the
/// request took a slot in the local order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrTicket {
    pub donor_index: i64,
    pub local_seqno: Seqno,
}

/// Failed request. The group layer may still have assigned a local
/// seqno, which the caller must self-cancel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("state transfer request rejected: {error}")]
pub struct StrRejected {
    pub error: GroupError,
    pub local_seqno: Seqno,
}

impl StrRejected {
    pub fn new(error: GroupError) -> Self {
        Self {
            error,
            local_seqno: SEQNO_UNDEFINED,
        }
    }
}

/// One delivery from the totally-ordered stream.
#[derive(Clone, Debug)]
pub enum Action {
    Ordered(WriteSet),
    StateRequest {
        request: Bytes,
        /// Slot the request takes in the local order.
        local_seqno: Seqno,
        /// Last globally-ordered seqno at delivery on the donor.
        donor_seqno: Seqno,
        requestor: String,
    },
    Conf(ViewInfo),
    /// This node's transfer concluded with `status` (seqno or negated
    /// errno).
    Joined { status: i64 },
    /// Flow control reports this node caught up.
    Synced,
}

pub trait Group: Send + Sync {
    /// Ask the group to select a donor. Blocking. `ist_uuid`/`ist_seqno`
    /// advertise the incremental range start so donor selection can
    /// prefer nodes able to serve it (`SEQNO_UNDEFINED` when absent).
    fn request_state_transfer(
        &self,
        version: u8,
        request: &[u8],
        donor_hint: &str,
        ist_uuid: Uuid,
        ist_seqno: Seqno,
    ) -> Result<StrTicket, StrRejected>;

    /// Report transfer completion: non-negative seqno on success,
    /// negated errno on failure.
    fn join(&self, status: i64) -> Result<(), GroupError>;

    fn set_last_applied(&self, seqno: Seqno);

    fn close(&self, explicit: bool);

    /// Deliver the next totally-ordered action. Blocking; `Closed` ends
    /// the receive loop.
    fn recv(&self) -> Result<Action, GroupError>;

    /// Last known group seqno for a state uuid, if any.
    fn state_seqno(&self, uuid: &Uuid) -> Option<Seqno>;
}
