//! Boundary status codes.
//!
//! Transfer outcomes cross the group layer as signed status values: a
//! non-negative value is a seqno, a negative value is a negated POSIX
//! errno. This module pins the errno family used at that boundary.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Errno {
    Perm,
    Again,
    NoMem,
    Inval,
    Deadlock,
    NoData,
    MsgSize,
    NotConn,
    Canceled,
}

impl Errno {
    /// The raw (positive) errno value, Linux numbering.
    pub fn raw(self) -> i64 {
        match self {
            Errno::Perm => 1,
            Errno::Again => 11,
            Errno::NoMem => 12,
            Errno::Inval => 22,
            Errno::Deadlock => 35,
            Errno::NoData => 61,
            Errno::MsgSize => 90,
            Errno::NotConn => 107,
            Errno::Canceled => 125,
        }
    }

    /// The negated form used in join/transfer status values.
    pub fn status(self) -> i64 {
        -self.raw()
    }

    pub fn from_status(status: i64) -> Option<Self> {
        match -status {
            1 => Some(Errno::Perm),
            11 => Some(Errno::Again),
            12 => Some(Errno::NoMem),
            22 => Some(Errno::Inval),
            35 => Some(Errno::Deadlock),
            61 => Some(Errno::NoData),
            90 => Some(Errno::MsgSize),
            107 => Some(Errno::NotConn),
            125 => Some(Errno::Canceled),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Errno::Perm => "EPERM",
            Errno::Again => "EAGAIN",
            Errno::NoMem => "ENOMEM",
            Errno::Inval => "EINVAL",
            Errno::Deadlock => "EDEADLK",
            Errno::NoData => "ENODATA",
            Errno::MsgSize => "EMSGSIZE",
            Errno::NotConn => "ENOTCONN",
            Errno::Canceled => "ECANCELED",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_negated_raw() {
        assert_eq!(Errno::Canceled.status(), -125);
        assert_eq!(Errno::NoData.status(), -61);
        assert_eq!(Errno::Deadlock.status(), -35);
    }

    #[test]
    fn from_status_roundtrips() {
        for errno in [
            Errno::Perm,
            Errno::Again,
            Errno::NoMem,
            Errno::Inval,
            Errno::Deadlock,
            Errno::NoData,
            Errno::MsgSize,
            Errno::NotConn,
            Errno::Canceled,
        ] {
            assert_eq!(Errno::from_status(errno.status()), Some(errno));
        }
        assert_eq!(Errno::from_status(0), None);
        assert_eq!(Errno::from_status(-9999), None);
    }
}
