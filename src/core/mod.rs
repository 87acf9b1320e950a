//! Core atoms: identities, sequence numbers, write-sets, node states.

pub mod error;
pub mod gtid;
pub mod state;
pub mod view;
pub mod writeset;

pub use error::Errno;
pub use gtid::{Gtid, SEQNO_UNDEFINED, Seqno};
pub use state::{InvalidTransition, NodeState, StateMachine};
pub use view::{ViewInfo, ViewStatus};
pub use writeset::{WriteSet, WriteSetError, WriteSetState};
