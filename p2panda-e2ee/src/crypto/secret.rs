// SPDX-License-Identifier: MIT OR Apache-2.0

//! Container for key material: ratchet chain keys, message keys, shared secrets.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Sensitive bytes which are wiped from memory on drop.
///
/// Bytes can only be read from inside this crate, debug output never shows them and equality
/// checks run in constant time.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0[..].ct_eq(&other.0[..]))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::Secret;

    #[test]
    fn redacted_debug() {
        let secret = Secret::from_bytes([7u8; 4]);
        assert_eq!(format!("{secret:?}"), "Secret<4>(***)");
    }

    #[test]
    fn equality() {
        assert_eq!(Secret::from_bytes([1u8; 32]), Secret::from_bytes([1u8; 32]));
        assert_ne!(Secret::from_bytes([1u8; 32]), Secret::from_bytes([2u8; 32]));
    }
}
