//! Replicated write-sets and their ordering metadata.

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

use super::gtid::{SEQNO_UNDEFINED, Seqno};

/// Lifecycle of a write-set on this node. Incremental-transfer replay
/// re-enters the pipeline at `Certifying` since the donor has already
/// replicated and certified it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteSetState {
    Replicating,
    Certifying,
    Applying,
    Committed,
}

/// One entry of the totally-ordered stream.
///
/// `seqno_g` is the global order, `seqno_l` the local delivery order,
/// `depends_seqno` the last seqno this write-set depends on. A
/// `depends_seqno` of `-1` marks a no-op action that only occupies its
/// ordering slots.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteSet {
    pub seqno_g: Seqno,
    pub seqno_l: Seqno,
    pub depends_seqno: Seqno,
    pub payload: Bytes,
    pub checksum: u32,
    state: WriteSetState,
}

impl WriteSet {
    pub fn new(seqno_g: Seqno, seqno_l: Seqno, depends_seqno: Seqno, payload: Bytes) -> Self {
        let checksum = crc32c(&payload);
        Self {
            seqno_g,
            seqno_l,
            depends_seqno,
            payload,
            checksum,
            state: WriteSetState::Replicating,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.depends_seqno == SEQNO_UNDEFINED
    }

    pub fn state(&self) -> WriteSetState {
        self.state
    }

    pub fn set_state(&mut self, next: WriteSetState) {
        debug_assert!(next as u8 >= self.state as u8, "write-set state regressed");
        self.state = next;
    }

    pub fn verify_checksum(&self) -> Result<(), WriteSetError> {
        let got = crc32c(&self.payload);
        if got != self.checksum {
            return Err(WriteSetError::ChecksumMismatch {
                seqno: self.seqno_g,
                expected: self.checksum,
                got,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WriteSetError {
    #[error("write-set {seqno} checksum mismatch: expected {expected} got {got}")]
    ChecksumMismatch { seqno: Seqno, expected: u32, got: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies_and_detects_corruption() {
        let mut ws = WriteSet::new(10, 3, 9, Bytes::from_static(b"payload"));
        ws.verify_checksum().unwrap();

        ws.payload = Bytes::from_static(b"tampered");
        let err = ws.verify_checksum().unwrap_err();
        assert!(matches!(err, WriteSetError::ChecksumMismatch { seqno: 10, .. }));
    }

    #[test]
    fn noop_is_keyed_on_depends_seqno() {
        let ws = WriteSet::new(10, 3, SEQNO_UNDEFINED, Bytes::new());
        assert!(ws.is_noop());
        let ws = WriteSet::new(10, 3, 0, Bytes::new());
        assert!(!ws.is_noop());
    }

    #[test]
    fn state_advances() {
        let mut ws = WriteSet::new(1, 1, 0, Bytes::new());
        assert_eq!(ws.state(), WriteSetState::Replicating);
        ws.set_state(WriteSetState::Certifying);
        ws.set_state(WriteSetState::Applying);
        ws.set_state(WriteSetState::Committed);
        assert_eq!(ws.state(), WriteSetState::Committed);
    }
}
