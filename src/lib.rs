//! State-transfer coordination for a multi-master replication group.
//!
//! A node that falls behind the group closes the gap through one of two
//! transfers: a full snapshot (SST) moved by the host application, or an
//! incremental replay (IST) of write-sets from a donor's cache. This
//! crate implements the coordination around both: the versioned state
//! request wire format, the joiner and donor protocols, the ordering
//! monitors that fence transfers against live traffic, and the durable
//! safety marker that decides on restart whether local data can be
//! trusted.
//!
//! The group-communication layer, the write-set applier and the
//! snapshot transport are host concerns behind the [`group::Group`],
//! [`replicator::Applier`] and [`sst::SstDonor`] traits.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod core;
pub mod group;
pub mod ist;
pub mod monitor;
pub mod proto;
pub mod replicator;
pub mod safety;
pub mod sst;
pub mod telemetry;
pub mod test_support;

pub use crate::cache::{CacheError, SeqnoGuard, WritesetCache};
pub use crate::config::{CommitOrder, Config};
pub use crate::core::{
    Errno, Gtid, InvalidTransition, NodeState, SEQNO_UNDEFINED, Seqno, ViewInfo, ViewStatus,
    WriteSet, WriteSetState,
};
pub use crate::group::{Action, Group, GroupError, StrRejected, StrTicket};
pub use crate::ist::{IstBus, IstError, IstReceiver, IstSenders};
pub use crate::monitor::Monitor;
pub use crate::proto::{CodecError, IstRequest, StateRequest};
pub use crate::replicator::{
    Applier, ApplyError, Replicator, ReplicatorError, Services, StateTransferKind, TransferError,
    Unrecoverable,
};
pub use crate::safety::{SafetyFile, SafetyMarker};
pub use crate::sst::{SstDonor, SstError, StateProvider, TRIVIAL_SST};
