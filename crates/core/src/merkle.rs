//! Merkle roots over transaction hashes.

use crate::hash::{hash_concat, Hash};

/// Compute the merkle root of a list of hashes.
///
/// Returns the zero hash if the list is empty. An odd node at any level is
/// paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                hash_concat(&[pair[0].as_ref(), right.as_ref()])
            })
            .collect();
    }

    level[0]
}
