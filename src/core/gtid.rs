//! Global transaction identity: (group uuid, global seqno).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Global or local sequence number. Signed: `-1` means undefined.
pub type Seqno = i64;

/// Sentinel for "no position": fresh nodes and mid-transfer markers.
pub const SEQNO_UNDEFINED: Seqno = -1;

/// Global transaction id. `seqno == 0` denotes the empty (just created)
/// group state, `seqno == -1` an undefined position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub uuid: Uuid,
    pub seqno: Seqno,
}

impl Gtid {
    pub fn new(uuid: Uuid, seqno: Seqno) -> Self {
        Self { uuid, seqno }
    }

    pub fn undefined() -> Self {
        Self {
            uuid: Uuid::nil(),
            seqno: SEQNO_UNDEFINED,
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.uuid.is_nil() && self.seqno == SEQNO_UNDEFINED
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seqno)
    }
}

impl fmt::Debug for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gtid({}:{})", self.uuid, self.seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_uuid_colon_seqno() {
        let gtid = Gtid::new(Uuid::from_bytes([0xab; 16]), 42);
        assert_eq!(gtid.to_string(), "abababab-abab-abab-abab-abababababab:42");
    }

    #[test]
    fn undefined_roundtrip() {
        let gtid = Gtid::undefined();
        assert!(gtid.is_undefined());
        assert_eq!(gtid.seqno, SEQNO_UNDEFINED);
        assert!(!Gtid::new(Uuid::nil(), 0).is_undefined());
    }
}
