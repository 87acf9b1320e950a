//! Incremental state transfer: replay of a contiguous write-set range
//! from the donor's cache to a joiner.
//!
//! The wire transport is out of scope; the stream runs over an
//! addressable in-process channel (`IstBus`). The receiver side is owned
//! by the joiner controller for the duration of one request; each active
//! donation owns one sender thread plus the cache range lock it carries.

mod bus;
mod receiver;
mod sender;

pub use bus::IstBus;
pub use receiver::IstReceiver;
pub use sender::IstSenders;

use thiserror::Error;

use crate::core::{Errno, Seqno, WriteSet};

#[derive(Clone, Debug)]
pub enum IstMessage {
    WriteSet(WriteSet),
    /// End of range; `last` is the final seqno the sender produced.
    Eof { last: Seqno },
}

#[derive(Debug, Error)]
pub enum IstError {
    #[error("no ist endpoint registered at {addr}")]
    PeerNotFound { addr: String },
    #[error("ist receiver is {state}, cannot {op}")]
    BadState { state: &'static str, op: &'static str },
    #[error("ist stream closed before end of range")]
    StreamClosed,
    #[error("ist range [{first}, {last}] is empty")]
    BadRange { first: Seqno, last: Seqno },
}

impl IstError {
    pub fn errno(&self) -> Errno {
        match self {
            IstError::PeerNotFound { .. } => Errno::NotConn,
            IstError::BadState { .. } => Errno::Perm,
            IstError::StreamClosed => Errno::NotConn,
            IstError::BadRange { .. } => Errno::Inval,
        }
    }
}
