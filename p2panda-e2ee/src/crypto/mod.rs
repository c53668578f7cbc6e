// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic algorithms and secure random number generation used by `p2panda-e2ee`.
//!
//! Following algorithms are used:
//! * ChaCha random number generator with 20 rounds
//! * XChaCha20-Poly1305 AEAD
//! * HKDF with SHA256
//! * SHA2-256 and SHA2-512 hashing functions
//! * XEdDSA signatures over Curve25519 keys
//! * ECDH key agreement with X25519
pub mod hkdf;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xchacha20;
pub mod xeddsa;

pub use rng::{Rng, RngError};
pub use secret::Secret;
