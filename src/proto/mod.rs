//! Wire formats for state-transfer coordination.

pub mod ist_request;
pub mod state_request;

pub use ist_request::IstRequest;
pub use state_request::{CodecError, MAGIC, StateRequest, encode_v0, encode_v1, parse};
