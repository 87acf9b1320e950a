//! Incremental-transfer descriptor, carried inside a v1 state request.
//!
//! Textual form: `<uuid>:<last_applied>-<group_seqno>|<peer_addr>`.
//! The emitter is strict; the parser tolerates whitespace around the
//! separators and a trailing NUL (the descriptor travels as a
//! NUL-terminated section on the wire).

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::core::Seqno;

use super::state_request::CodecError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IstRequest {
    pub peer: String,
    pub uuid: Uuid,
    pub last_applied: Seqno,
    pub group_seqno: Seqno,
}

impl IstRequest {
    pub fn new(peer: impl Into<String>, uuid: Uuid, last_applied: Seqno, group_seqno: Seqno) -> Self {
        debug_assert!(last_applied < group_seqno, "empty incremental range");
        Self {
            peer: peer.into(),
            uuid,
            last_applied,
            group_seqno,
        }
    }

    /// Wire form: the textual descriptor, NUL-terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.push(0);
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| bad("descriptor is not utf-8"))?;
        text.parse()
    }
}

impl fmt::Display for IstRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}|{}",
            self.uuid, self.last_applied, self.group_seqno, self.peer
        )
    }
}

impl FromStr for IstRequest {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        let (uuid_part, rest) = s
            .split_once(':')
            .ok_or_else(|| bad("missing ':' after uuid"))?;
        let uuid = Uuid::parse_str(uuid_part.trim())
            .map_err(|err| bad(format!("bad uuid: {err}")))?;

        let (last_applied, rest) = take_seqno(rest.trim_start())
            .ok_or_else(|| bad("missing last-applied seqno"))?;
        let rest = rest
            .trim_start()
            .strip_prefix('-')
            .ok_or_else(|| bad("missing '-' between seqnos"))?;
        let (group_seqno, rest) = take_seqno(rest.trim_start())
            .ok_or_else(|| bad("missing group seqno"))?;
        let rest = rest
            .trim_start()
            .strip_prefix('|')
            .ok_or_else(|| bad("missing '|' before peer address"))?;
        let peer = rest.trim();
        if peer.is_empty() {
            return Err(bad("missing peer address"));
        }

        Ok(Self {
            peer: peer.to_string(),
            uuid,
            last_applied,
            group_seqno,
        })
    }
}

fn bad(reason: impl Into<String>) -> CodecError {
    CodecError::BadFormat {
        reason: reason.into(),
    }
}

/// Greedily consume a signed decimal prefix. The sign has to be handled
/// here because '-' doubles as the range separator.
fn take_seqno(s: &str) -> Option<(Seqno, &str)> {
    let (sign, digits_from) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s),
    };
    let end = digits_from
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits_from.len());
    if end == 0 {
        return None;
    }
    let value: Seqno = digits_from[..end].parse().ok()?;
    Some((sign * value, &digits_from[end..]))
}
