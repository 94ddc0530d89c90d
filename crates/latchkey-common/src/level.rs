//! Lock levels and their compatibility rules

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Kind of access requested on a lock.
///
/// WRITE and SYNCHRONOUS_WRITE exclude everything except CONCURRENT; READ is
/// shared among readers; CONCURRENT never conflicts with anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LockLevel {
    Read = 1,
    Write = 2,
    SynchronousWrite = 3,
    Concurrent = 4,
}

impl LockLevel {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(LockLevel::Read),
            2 => Some(LockLevel::Write),
            3 => Some(LockLevel::SynchronousWrite),
            4 => Some(LockLevel::Concurrent),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        self == LockLevel::Read
    }

    pub fn is_write(self) -> bool {
        matches!(self, LockLevel::Write | LockLevel::SynchronousWrite)
    }

    pub fn is_concurrent(self) -> bool {
        self == LockLevel::Concurrent
    }

    /// Whether two holds at these levels may not coexist on one lock.
    pub fn conflicts_with(self, other: LockLevel) -> bool {
        if self.is_concurrent() || other.is_concurrent() {
            return false;
        }
        self.is_write() || other.is_write()
    }

    /// Whether holding `self` already grants what `requested` asks for.
    ///
    /// A write-level hold (or lease) accommodates reads and both write
    /// flavours; a read hold only accommodates reads.
    pub fn covers(self, requested: LockLevel) -> bool {
        match requested {
            LockLevel::Concurrent => true,
            LockLevel::Read => self.is_read() || self.is_write(),
            LockLevel::Write | LockLevel::SynchronousWrite => self.is_write(),
        }
    }

    /// Level of the node-wide lease granted for a request at this level.
    pub fn lease_level(self) -> LockLevel {
        match self {
            LockLevel::SynchronousWrite => LockLevel::Write,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::Read => "READ",
            LockLevel::Write => "WRITE",
            LockLevel::SynchronousWrite => "SYNCHRONOUS_WRITE",
            LockLevel::Concurrent => "CONCURRENT",
        }
    }
}

impl Display for LockLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LockLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Ok(LockLevel::Read),
            "WRITE" => Ok(LockLevel::Write),
            "SYNCHRONOUS_WRITE" => Ok(LockLevel::SynchronousWrite),
            "CONCURRENT" => Ok(LockLevel::Concurrent),
            _ => Err(format!("Invalid lock level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [LockLevel; 4] = [
        LockLevel::Read,
        LockLevel::Write,
        LockLevel::SynchronousWrite,
        LockLevel::Concurrent,
    ];

    #[test]
    fn test_conflict_matrix() {
        use LockLevel::*;
        assert!(!Read.conflicts_with(Read));
        assert!(Read.conflicts_with(Write));
        assert!(Read.conflicts_with(SynchronousWrite));
        assert!(Write.conflicts_with(Write));
        assert!(Write.conflicts_with(SynchronousWrite));
        assert!(SynchronousWrite.conflicts_with(SynchronousWrite));
        for level in ALL {
            assert!(!Concurrent.conflicts_with(level));
            assert!(!level.conflicts_with(Concurrent));
        }
    }

    #[test]
    fn test_covers() {
        use LockLevel::*;
        assert!(Write.covers(Read));
        assert!(Write.covers(SynchronousWrite));
        assert!(SynchronousWrite.covers(Write));
        assert!(Read.covers(Read));
        assert!(!Read.covers(Write));
        assert!(!Read.covers(SynchronousWrite));
    }

    #[test]
    fn test_lease_level() {
        assert_eq!(LockLevel::SynchronousWrite.lease_level(), LockLevel::Write);
        assert_eq!(LockLevel::Read.lease_level(), LockLevel::Read);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("read".parse::<LockLevel>().unwrap(), LockLevel::Read);
        assert_eq!(
            "SYNCHRONOUS_WRITE".parse::<LockLevel>().unwrap(),
            LockLevel::SynchronousWrite
        );
        assert!("exclusive".parse::<LockLevel>().is_err());
        assert_eq!(LockLevel::Concurrent.to_string(), "CONCURRENT");
    }

    proptest! {
        #[test]
        fn prop_conflicts_is_symmetric(a in 0usize..4, b in 0usize..4) {
            prop_assert_eq!(ALL[a].conflicts_with(ALL[b]), ALL[b].conflicts_with(ALL[a]));
        }

        #[test]
        fn prop_ordinal_roundtrip(i in 0usize..4) {
            prop_assert_eq!(LockLevel::from_ordinal(ALL[i].ordinal()), Some(ALL[i]));
        }
    }
}
