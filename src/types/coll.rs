use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// collection identifier
///
/// prints as fixed 16-digit lowercase hex; that printed form is the name of
/// the collection's directory under the store basedir.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CollectionId(pub u64);

impl CollectionId {
    /// parse the fixed encoding this type prints
    ///
    /// rejects anything that is not exactly 16 lowercase hex digits, so
    /// stray basedir entries (fsid, commit_op_seq, trans.N) never parse as
    /// collections.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(CollectionId)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionId::parse(s).ok_or(())
    }
}

impl From<u64> for CollectionId {
    fn from(v: u64) -> Self {
        CollectionId(v)
    }
}
