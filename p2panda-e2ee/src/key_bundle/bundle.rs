// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::{XEdDSAError, XSignature};
use crate::key_bundle::{LifetimeError, OneTimePreKey, OneTimePreKeyId, SignedPreKey};

/// Public key material of a remote device needed to start a pairwise session with it.
///
/// Claiming a bundle from the directory hands out at most one one-time pre-key. Bundles without
/// one-time pre-key are the fallback when the device ran out of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    identity_key: PublicKey,
    signed_prekey: SignedPreKey,
    prekey_signature: XSignature,
    onetime_prekey: Option<OneTimePreKey>,
}

impl PrekeyBundle {
    pub fn new(
        identity_key: PublicKey,
        signed_prekey: SignedPreKey,
        prekey_signature: XSignature,
        onetime_prekey: Option<OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key,
            signed_prekey,
            prekey_signature,
            onetime_prekey,
        }
    }

    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    pub fn prekey_signature(&self) -> &XSignature {
        &self.prekey_signature
    }

    pub fn onetime_prekey(&self) -> Option<&PublicKey> {
        self.onetime_prekey.as_ref().map(|key| key.key())
    }

    pub fn onetime_prekey_id(&self) -> Option<OneTimePreKeyId> {
        self.onetime_prekey.as_ref().map(|key| key.id())
    }

    /// Checks lifetime and identity signature of the signed pre-key.
    pub fn verify(&self) -> Result<(), KeyBundleError> {
        self.signed_prekey.verify_lifetime()?;
        self.signed_prekey
            .verify_signature(&self.identity_key, &self.prekey_signature)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),

    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
}
