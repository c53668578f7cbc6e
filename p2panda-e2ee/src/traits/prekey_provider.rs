// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Debug, Display};

use crate::crypto::x25519::PublicKey;
use crate::device::DeviceAddress;
use crate::key_bundle::PrekeyBundle;
use crate::prekey_directory::PrekeyDirectoryError;

/// Client-side access to the pre-keys of remote devices.
///
/// Claiming is not idempotent. A failed claim needs to be retried with a fresh claim, the
/// response must never be replayed.
pub trait PrekeyProvider {
    type Error: Debug + Display;

    /// Claims one unconsumed one-time pre-key together with the current signed pre-key.
    fn claim(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<PrekeyBundle, PrekeyDirectoryError<Self::Error>>>;

    /// Returns a bundle without one-time pre-key, to be used when none are left.
    fn signed_prekey_bundle(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<PrekeyBundle, PrekeyDirectoryError<Self::Error>>>;

    /// Published identity key of a device, if known.
    fn identity_key(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<Option<PublicKey>, PrekeyDirectoryError<Self::Error>>>;
}
