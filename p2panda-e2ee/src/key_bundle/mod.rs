// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pre-keys and key bundles a device publishes to asynchronously receive encrypted messages from
//! others.
//!
//! This is for asynchronous settings where one device ("Bob") is offline but has published a key
//! bundle (identity key, signed pre-key, one-time pre-keys) to a [`PrekeyDirectory`] beforehand.
//! Another device ("Alice") claims one bundle and uses it to start a pairwise session with Bob.
//!
//! One-time pre-keys are handed out exactly once. When they ran out, a claimer can fall back to a
//! bundle with only the signed pre-key, which is reused until the owner rotates it and thus gives
//! weaker forward secrecy for the first message.
//!
//! [`PrekeyDirectory`]: crate::PrekeyDirectory
mod bundle;
mod lifetime;
mod prekey;

pub use bundle::{KeyBundleError, PrekeyBundle};
pub use lifetime::{Lifetime, LifetimeError};
pub use prekey::{OneTimePreKey, OneTimePreKeyId, PreKeyId, SignedPreKey};
