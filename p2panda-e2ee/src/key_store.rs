// SPDX-License-Identifier: MIT OR Apache-2.0

//! Store for our own secret key material.
//!
//! The key store generates and holds the long-term identity key of this device together with the
//! secrets of all pre-keys it published. Only public halves ever leave it: the identity key via
//! [`KeyStore::export_public_identity`] and signed or one-time pre-keys for publication.
//!
//! Devices should rotate their signed pre-key in good time before it expires and replenish their
//! one-time pre-keys when the directory runs low.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::xeddsa::{XEdDSAError, XSignature};
use crate::crypto::{Rng, RngError};
use crate::error::ErrorClass;
use crate::key_bundle::{Lifetime, OneTimePreKey, OneTimePreKeyId, PreKeyId, SignedPreKey};
use crate::time::now;

/// Key store to maintain the identity secret and pre-key secrets of this device.
#[derive(Clone, Debug)]
pub struct KeyStore;

/// Serializable state of key store (for persistence).
///
/// This state holds private key material and must only be persisted in local, protected storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyStoreState {
    identity_secret: SecretKey,
    identity_key: PublicKey,
    signed_prekeys: HashMap<PreKeyId, SignedPreKeyState>,
    onetime_secrets: HashMap<OneTimePreKeyId, SecretKey>,
    next_prekey_id: PreKeyId,
    next_onetime_id: OneTimePreKeyId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignedPreKeyState {
    prekey: SignedPreKey,
    signature: XSignature,
    secret: SecretKey,
}

impl KeyStoreState {
    fn latest_prekey(&self) -> Option<&SignedPreKeyState> {
        self.signed_prekeys
            .values()
            .filter(|state| state.prekey.verify_lifetime().is_ok())
            .max_by_key(|state| (state.prekey.lifetime().not_after(), state.prekey.id()))
    }

    pub(crate) fn identity_secret(&self) -> &SecretKey {
        &self.identity_secret
    }

    /// Number of one-time pre-key secrets which were not used yet.
    pub fn onetime_secrets_len(&self) -> usize {
        self.onetime_secrets.len()
    }
}

impl KeyStore {
    /// Generates a new identity key for this device.
    ///
    /// Fails only when no randomness is available, which is fatal.
    pub fn generate_identity(rng: &Rng) -> Result<KeyStoreState, KeyStoreError> {
        let identity_secret = SecretKey::from_bytes(rng.random_array()?);
        let identity_key = identity_secret.public_key()?;

        debug!(identity_key = %identity_key, "generated new device identity");

        Ok(KeyStoreState {
            identity_secret,
            identity_key,
            signed_prekeys: HashMap::new(),
            onetime_secrets: HashMap::new(),
            next_prekey_id: 0,
            next_onetime_id: 0,
        })
    }

    /// Generates a new identity together with a first signed pre-key.
    pub fn init(rng: &Rng, lifetime: Lifetime) -> Result<KeyStoreState, KeyStoreError> {
        let y = Self::generate_identity(rng)?;
        let (y, _, _) = Self::rotate_signed_prekey(y, lifetime, rng)?;
        Ok(y)
    }

    /// Returns the public identity key for publication.
    pub fn export_public_identity(y: &KeyStoreState) -> PublicKey {
        y.identity_key
    }

    /// Generates a new signed pre-key with the given lifetime.
    ///
    /// Older pre-keys are kept until they expired, so sessions started with them can still be
    /// accepted.
    pub fn rotate_signed_prekey(
        mut y: KeyStoreState,
        lifetime: Lifetime,
        rng: &Rng,
    ) -> Result<(KeyStoreState, SignedPreKey, XSignature), KeyStoreError> {
        let secret = SecretKey::from_bytes(rng.random_array()?);
        let prekey = SignedPreKey::new(y.next_prekey_id, secret.public_key()?, lifetime);
        let signature = prekey.sign(&y.identity_secret, rng)?;

        y.signed_prekeys.insert(
            prekey.id(),
            SignedPreKeyState {
                prekey,
                signature,
                secret,
            },
        );
        y.next_prekey_id += 1;

        debug!(prekey_id = prekey.id(), "rotated signed pre-key");

        Ok((y, prekey, signature))
    }

    /// Generates a batch of one-time pre-keys, keeping their secrets.
    pub fn generate_onetime_prekeys(
        mut y: KeyStoreState,
        count: usize,
        rng: &Rng,
    ) -> Result<(KeyStoreState, Vec<OneTimePreKey>), KeyStoreError> {
        let mut prekeys = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = SecretKey::from_bytes(rng.random_array()?);
            let prekey = OneTimePreKey::new(y.next_onetime_id, secret.public_key()?);
            let existing = y.onetime_secrets.insert(prekey.id(), secret);
            // Sanity check.
            assert!(existing.is_none(), "should never insert same id more than once");
            y.next_onetime_id += 1;
            prekeys.push(prekey);
        }
        Ok((y, prekeys))
    }

    /// Returns the latest valid signed pre-key and its signature for publication.
    pub fn publication(y: &KeyStoreState) -> Result<(SignedPreKey, XSignature), KeyStoreError> {
        y.latest_prekey()
            .map(|state| (state.prekey, state.signature))
            .ok_or(KeyStoreError::NoPreKeysAvailable)
    }

    /// Returns true if the latest signed pre-key is older than `rotate_after` seconds or there is
    /// no valid one at all.
    pub fn needs_rotation(y: &KeyStoreState, rotate_after: u64) -> bool {
        match y.latest_prekey() {
            Some(state) => {
                state.prekey.lifetime().not_before().saturating_add(rotate_after) <= now()
            }
            None => true,
        }
    }

    /// Returns signed pre-key secret by id.
    pub(crate) fn prekey_secret(
        y: &KeyStoreState,
        id: PreKeyId,
    ) -> Result<&SecretKey, KeyStoreError> {
        y.signed_prekeys
            .get(&id)
            .map(|state| &state.secret)
            .ok_or(KeyStoreError::UnknownPreKeySecret(id))
    }

    /// Removes and returns a one-time pre-key secret.
    ///
    /// Fails when the secret is unknown, it was probably used once already.
    pub(crate) fn use_onetime_secret(
        mut y: KeyStoreState,
        id: OneTimePreKeyId,
    ) -> Result<(KeyStoreState, SecretKey), KeyStoreError> {
        match y.onetime_secrets.remove(&id) {
            Some(secret) => Ok((y, secret)),
            None => Err(KeyStoreError::UnknownOneTimeSecret(id)),
        }
    }

    /// Removes all expired signed pre-keys.
    pub fn remove_expired(mut y: KeyStoreState) -> KeyStoreState {
        y.signed_prekeys
            .retain(|_, state| state.prekey.verify_lifetime().is_ok());
        y
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error("could not find one-time pre-key secret with id {0}")]
    UnknownOneTimeSecret(OneTimePreKeyId),

    #[error("could not find signed pre-key secret with id {0}")]
    UnknownPreKeySecret(PreKeyId),

    #[error("no valid pre-keys available, they are either expired or too early")]
    NoPreKeysAvailable,
}

impl KeyStoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KeyStoreError::Rng(_) | KeyStoreError::XEdDSA(_) | KeyStoreError::X25519(_) => {
                ErrorClass::Fatal
            }
            KeyStoreError::UnknownOneTimeSecret(_)
            | KeyStoreError::UnknownPreKeySecret(_)
            | KeyStoreError::NoPreKeysAvailable => ErrorClass::KeyAvailability,
        }
    }
}
