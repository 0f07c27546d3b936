use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalbakError};

/// Snapshot identifier, monotonically issued by the storage daemon.
pub type Gid = u64;

/// A snapshot point. `gid0 == gid1` denotes a clean (consistent) point;
/// `gid0 < gid1` a dirty range still covered by in-flight writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snap {
    pub gid0: Gid,
    pub gid1: Gid,
}

impl Snap {
    pub fn new(gid0: Gid, gid1: Gid) -> Result<Self> {
        if gid0 > gid1 {
            return Err(WalbakError::BadRequest(format!(
                "snap gid0 must not exceed gid1: {gid0} > {gid1}"
            )));
        }
        Ok(Snap { gid0, gid1 })
    }

    /// Clean snapshot at a single gid.
    pub fn clean(gid: Gid) -> Self {
        Snap { gid0: gid, gid1: gid }
    }

    pub fn is_clean(&self) -> bool {
        self.gid0 == self.gid1
    }

    pub fn is_dirty(&self) -> bool {
        !self.is_clean()
    }
}

impl fmt::Display for Snap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "|{}|", self.gid0)
        } else {
            write!(f, "|{},{}|", self.gid0, self.gid1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_and_dirty() {
        assert!(Snap::clean(5).is_clean());
        let s = Snap::new(3, 7).unwrap();
        assert!(s.is_dirty());
        assert_eq!(s.to_string(), "|3,7|");
        assert_eq!(Snap::clean(5).to_string(), "|5|");
    }

    #[test]
    fn rejects_inverted_pair() {
        assert!(Snap::new(7, 3).is_err());
    }
}
