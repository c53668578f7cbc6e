// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::Rng;
use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey};
use crate::crypto::xeddsa::{XEdDSAError, XSignature, xeddsa_sign, xeddsa_verify};
use crate::key_bundle::{Lifetime, LifetimeError};

/// Identifier of a device's signed pre-key, monotonically increasing per device.
pub type PreKeyId = u64;

/// Identifier of a device's one-time pre-key, monotonically increasing per device.
pub type OneTimePreKeyId = u64;

/// Pre-key signed by the device's identity key, reused until it gets rotated or its lifetime
/// expired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    id: PreKeyId,
    key: PublicKey,
    lifetime: Lifetime,
}

impl SignedPreKey {
    pub fn new(id: PreKeyId, key: PublicKey, lifetime: Lifetime) -> Self {
        Self { id, key, lifetime }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Bytes covered by the identity signature: id, public key and lifetime.
    pub fn to_signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + PUBLIC_KEY_SIZE + 16);
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(self.key.as_bytes());
        bytes.extend_from_slice(&self.lifetime.to_bytes());
        bytes
    }

    pub fn sign(&self, identity_secret: &SecretKey, rng: &Rng) -> Result<XSignature, XEdDSAError> {
        xeddsa_sign(&self.to_signed_bytes(), identity_secret, rng)
    }

    pub fn verify_signature(
        &self,
        identity_key: &PublicKey,
        signature: &XSignature,
    ) -> Result<(), XEdDSAError> {
        xeddsa_verify(&self.to_signed_bytes(), identity_key, signature)
    }

    pub fn verify_lifetime(&self) -> Result<(), LifetimeError> {
        self.lifetime.verify()
    }
}

/// Pre-key to be used exactly _once_ for starting a pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    id: OneTimePreKeyId,
    key: PublicKey,
}

impl OneTimePreKey {
    pub fn new(id: OneTimePreKeyId, key: PublicKey) -> Self {
        Self { id, key }
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}
