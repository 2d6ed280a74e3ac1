//! Recipient addresses and the owner hashes derived from them.

use crate::hash::{hash, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 20-byte address carried by transaction outputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The hash under which balances and owner records are indexed.
    pub fn owner_hash(&self) -> Hash {
        hash(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_prefixed_hex() {
        let address = Address([0xAB; 20]);
        assert_eq!(address.to_string(), format!("0x{}", "ab".repeat(20)));
        assert_eq!(format!("{address:?}"), format!("Address(0x{})", "ab".repeat(20)));
    }

    #[test]
    fn test_owner_hash_is_stable() {
        let a = Address([1u8; 20]);
        let b = Address([2u8; 20]);
        assert_eq!(a.owner_hash(), a.owner_hash());
        assert_ne!(a.owner_hash(), b.owner_hash());
        assert_eq!(a.owner_hash(), hash(a.as_ref()));
    }
}
