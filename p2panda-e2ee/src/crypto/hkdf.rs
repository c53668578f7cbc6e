// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hashed Message Authentication Code (HMAC)-based key derivation function (HKDF) using
//! "hash-mode" with SHA256.
//!
//! The context info is passed in parts which get concatenated, similar to the inputs of
//! [`sha2_256`](crate::crypto::sha2::sha2_256).
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Derives `N` bytes of output key material. An empty salt is treated as no salt.
pub fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[&[u8]]) -> Result<[u8; N], HkdfError> {
    let salt = (!salt.is_empty()).then_some(salt);
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(salt, ikm)
        .expand_multi_info(info, &mut okm)
        .map_err(|_| HkdfError::OutputTooLong(N))?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("can't derive {0} bytes with hkdf-sha256")]
    OutputTooLong(usize),
}
