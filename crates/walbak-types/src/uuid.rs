use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalbakError};

/// Opaque 16-byte replica identity. Equal across the storage, proxy and
/// archive copies of the same live volume; re-assigned by full/hash sync.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub fn generate() -> Self {
        Uuid(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| WalbakError::BadRequest(format!("bad uuid '{s}': {e}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| WalbakError::BadRequest(format!("bad uuid length: '{s}'")))?;
        Ok(Uuid(bytes))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Debug prints the hex form; the raw bytes are never useful in logs.
impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_via_hex() {
        let u = Uuid::generate();
        let s = u.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(Uuid::parse(&s).unwrap(), u);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Uuid::parse("zz").is_err());
        assert!(Uuid::parse("00ff").is_err());
    }
}
