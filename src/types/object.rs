use std::fmt;

use serde::{Deserialize, Serialize};

/// snapshot identifier attached to an object
///
/// two values are reserved: [`SnapId::NOSNAP`] names the live head and
/// [`SnapId::SNAPDIR`] the directory-of-snaps view. everything else is a
/// concrete snapshot number. only the printed tag (`head`, `snapdir`, hex)
/// is on-disk stable.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapId(pub u64);

impl SnapId {
    /// the live head of an object
    pub const NOSNAP: SnapId = SnapId(u64::MAX);
    /// the directory-of-snaps view
    pub const SNAPDIR: SnapId = SnapId(u64::MAX - 1);

    pub fn is_head(self) -> bool {
        self == SnapId::NOSNAP
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == SnapId::NOSNAP {
            write!(f, "head")
        } else if *self == SnapId::SNAPDIR {
            write!(f, "snapdir")
        } else {
            write!(f, "{:x}", self.0)
        }
    }
}

impl From<u64> for SnapId {
    fn from(v: u64) -> Self {
        SnapId(v)
    }
}

/// object identifier: a name plus a snapshot id
///
/// the name is an arbitrary byte string (no interior NUL); it is escaped
/// before it becomes a file name, so `/`, `\` and a leading `.` are all
/// legal here.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub name: Vec<u8>,
    pub snap: SnapId,
}

impl ObjectId {
    pub fn new(name: impl Into<Vec<u8>>, snap: SnapId) -> Self {
        Self {
            name: name.into(),
            snap,
        }
    }

    /// the live head of the named object
    pub fn head(name: impl Into<Vec<u8>>) -> Self {
        Self::new(name, SnapId::NOSNAP)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", String::from_utf8_lossy(&self.name), self.snap)
    }
}
