// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Debug, Display};

use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::XSignature;
use crate::device::DeviceAddress;
use crate::key_bundle::{OneTimePreKey, SignedPreKey};

/// Storage of all published pre-keys, keyed by device address.
pub trait PrekeyStore {
    type Error: Debug + Display;

    fn identity_key(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<Option<PublicKey>, Self::Error>>;

    fn set_identity_key(
        &self,
        device: &DeviceAddress,
        identity_key: &PublicKey,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn signed_prekey(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<Option<(SignedPreKey, XSignature)>, Self::Error>>;

    fn set_signed_prekey(
        &self,
        device: &DeviceAddress,
        prekey: &SignedPreKey,
        signature: &XSignature,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Adds one-time pre-keys of a device.
    ///
    /// Pre-keys with an id which was published before are ignored, even when they were claimed
    /// already. Returns the number of newly added pre-keys.
    fn add_onetime_prekeys(
        &self,
        device: &DeviceAddress,
        prekeys: &[OneTimePreKey],
    ) -> impl Future<Output = Result<usize, Self::Error>>;

    /// Removes and returns one unconsumed one-time pre-key of a device.
    ///
    /// Implementations must do this atomically: concurrent callers never receive the same
    /// pre-key.
    fn claim_onetime_prekey(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<Option<OneTimePreKey>, Self::Error>>;

    fn onetime_prekey_count(
        &self,
        device: &DeviceAddress,
    ) -> impl Future<Output = Result<usize, Self::Error>>;
}
