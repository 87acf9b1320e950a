//! State Transfer Request wire format.
//!
//! Version 0 is the raw snapshot request: the whole blob is the SST
//! payload, verbatim. Version 1 (also used by protocol version 2) frames
//! both sections:
//!
//! ```text
//! "STRv1" NUL | u32be sst_len | sst bytes | u32be ist_len | ist bytes
//! ```
//!
//! Either section may be empty. The total length must match the declared
//! lengths exactly; a section may not exceed `i32::MAX` bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::Errno;

pub const MAGIC: &[u8] = b"STRv1";

const HEADER_LEN: usize = MAGIC.len() + 1; // magic + NUL
const LEN_FIELD: usize = 4;
const MAX_SECTION_LEN: usize = i32::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateRequest {
    V0 { sst: Bytes },
    V1 { sst: Bytes, ist: Bytes },
}

impl StateRequest {
    pub fn sst(&self) -> &[u8] {
        match self {
            StateRequest::V0 { sst } | StateRequest::V1 { sst, .. } => sst,
        }
    }

    pub fn ist(&self) -> &[u8] {
        match self {
            StateRequest::V0 { .. } => &[],
            StateRequest::V1 { ist, .. } => ist,
        }
    }

    pub fn has_ist(&self) -> bool {
        !self.ist().is_empty()
    }

    pub fn version(&self) -> u8 {
        match self {
            StateRequest::V0 { .. } => 0,
            StateRequest::V1 { .. } => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad state request format: {reason}")]
    BadFormat { reason: String },
    #[error("{section} section length {len} exceeds {MAX_SECTION_LEN}")]
    MessageTooLarge { section: &'static str, len: usize },
}

impl CodecError {
    fn bad(reason: impl Into<String>) -> Self {
        CodecError::BadFormat {
            reason: reason.into(),
        }
    }

    pub fn errno(&self) -> Errno {
        match self {
            CodecError::BadFormat { .. } => Errno::Inval,
            CodecError::MessageTooLarge { .. } => Errno::MsgSize,
        }
    }
}

fn check_section(section: &'static str, len: usize) -> Result<u32, CodecError> {
    if len > MAX_SECTION_LEN {
        return Err(CodecError::MessageTooLarge { section, len });
    }
    Ok(len as u32)
}

pub fn encode_v0(sst: &[u8]) -> Bytes {
    Bytes::copy_from_slice(sst)
}

pub fn encode_v1(sst: &[u8], ist: &[u8]) -> Result<Bytes, CodecError> {
    let sst_len = check_section("sst", sst.len())?;
    let ist_len = check_section("ist", ist.len())?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2 * LEN_FIELD + sst.len() + ist.len());
    buf.put_slice(MAGIC);
    buf.put_u8(0);
    buf.put_u32(sst_len);
    buf.put_slice(sst);
    buf.put_u32(ist_len);
    buf.put_slice(ist);
    Ok(buf.freeze())
}

fn is_v1(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf.starts_with(MAGIC) && buf[MAGIC.len()] == 0
}

/// Parse a request, autodetecting the version: anything not opening with
/// the v1 magic and NUL is a version 0 request by definition.
pub fn parse(buf: &[u8]) -> Result<StateRequest, CodecError> {
    if !is_v1(buf) {
        return Ok(StateRequest::V0 {
            sst: Bytes::copy_from_slice(buf),
        });
    }

    if buf.len() < HEADER_LEN + 2 * LEN_FIELD {
        return Err(CodecError::bad(format!(
            "request too short: {} bytes, need at least {}",
            buf.len(),
            HEADER_LEN + 2 * LEN_FIELD
        )));
    }

    let sst_len = read_len(buf, HEADER_LEN);
    let sst_end = HEADER_LEN
        .checked_add(LEN_FIELD)
        .and_then(|off| off.checked_add(sst_len))
        .ok_or_else(|| CodecError::bad("sst length overflows"))?;
    if sst_end + LEN_FIELD > buf.len() {
        return Err(CodecError::bad(format!(
            "sst length {sst_len} overflows request of {} bytes",
            buf.len()
        )));
    }

    let ist_len = read_len(buf, sst_end);
    let ist_end = sst_end
        .checked_add(LEN_FIELD)
        .and_then(|off| off.checked_add(ist_len))
        .ok_or_else(|| CodecError::bad("ist length overflows"))?;
    if ist_end != buf.len() {
        return Err(CodecError::bad(format!(
            "declared lengths {sst_len}+{ist_len} do not match request of {} bytes",
            buf.len()
        )));
    }

    Ok(StateRequest::V1 {
        sst: Bytes::copy_from_slice(&buf[HEADER_LEN + LEN_FIELD..sst_end]),
        ist: Bytes::copy_from_slice(&buf[sst_end + LEN_FIELD..ist_end]),
    })
}

fn read_len(buf: &[u8], offset: usize) -> usize {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]) as usize
}
