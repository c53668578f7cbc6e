// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement protocol as specified by Signal.
//!
//! X3DH establishes a shared secret key between two parties who mutually authenticate each other
//! based on public keys. The initiator combines its identity key and a fresh ephemeral key with
//! the published identity key, signed pre-key and (optional) one-time pre-key of the responder.
//! The responder derives the same secret from the initiator's first message without any further
//! round-trip.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use thiserror::Error;

use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::key_bundle::{KeyBundleError, PrekeyBundle};

/// ASCII string identifying the application as specified in X3DH used for KDF.
const KDF_INFO: &[u8] = b"p2panda-e2ee";

pub const SHARED_KEY_SIZE: usize = 32;

/// Output of the initiator's side of the key agreement.
pub(crate) struct X3DHInitiation {
    pub shared_key: Secret<SHARED_KEY_SIZE>,
    pub ephemeral_key: PublicKey,
}

pub(crate) fn x3dh_initiate(
    our_identity_secret: &SecretKey,
    their_prekey_bundle: &PrekeyBundle,
    rng: &Rng,
) -> Result<X3DHInitiation, X3DHError> {
    their_prekey_bundle.verify()?;

    let our_ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let our_ephemeral_key = our_ephemeral_secret.public_key()?;

    let mut ikm = Vec::with_capacity(if their_prekey_bundle.onetime_prekey().is_none() {
        32 * 4
    } else {
        32 * 5
    });

    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IKA, SPKB)
    ikm.extend_from_slice(
        our_identity_secret
            .calculate_agreement(their_prekey_bundle.signed_prekey().key())?
            .as_bytes(),
    );

    // DH2 = DH(EKA, IKB)
    ikm.extend_from_slice(
        our_ephemeral_secret
            .calculate_agreement(their_prekey_bundle.identity_key())?
            .as_bytes(),
    );

    // DH3 = DH(EKA, SPKB)
    ikm.extend_from_slice(
        our_ephemeral_secret
            .calculate_agreement(their_prekey_bundle.signed_prekey().key())?
            .as_bytes(),
    );

    // DH4 = DH(EKA, OPKB)
    if let Some(onetime_prekey) = their_prekey_bundle.onetime_prekey() {
        ikm.extend_from_slice(
            our_ephemeral_secret
                .calculate_agreement(onetime_prekey)?
                .as_bytes(),
        );
    }

    let shared_key: [u8; SHARED_KEY_SIZE] = {
        let salt = [0_u8; 32];
        hkdf(&salt, &ikm, &[KDF_INFO])?
    };

    drop(our_ephemeral_secret);
    drop(ikm);

    Ok(X3DHInitiation {
        shared_key: Secret::from_bytes(shared_key),
        ephemeral_key: our_ephemeral_key,
    })
}

pub(crate) fn x3dh_respond(
    our_identity_secret: &SecretKey,
    our_prekey_secret: &SecretKey,
    our_onetime_secret: Option<&SecretKey>,
    their_identity_key: &PublicKey,
    their_ephemeral_key: &PublicKey,
) -> Result<Secret<SHARED_KEY_SIZE>, X3DHError> {
    let mut ikm = Vec::with_capacity(if our_onetime_secret.is_none() {
        32 * 4
    } else {
        32 * 5
    });

    ikm.extend_from_slice(&[0xFFu8; 32]); // "discontinuity bytes"

    // DH1 = DH(IKA, SPKB)
    ikm.extend_from_slice(
        our_prekey_secret
            .calculate_agreement(their_identity_key)?
            .as_bytes(),
    );

    // DH2 = DH(EKA, IKB)
    ikm.extend_from_slice(
        our_identity_secret
            .calculate_agreement(their_ephemeral_key)?
            .as_bytes(),
    );

    // DH3 = DH(EKA, SPKB)
    ikm.extend_from_slice(
        our_prekey_secret
            .calculate_agreement(their_ephemeral_key)?
            .as_bytes(),
    );

    // DH4 = DH(EKA, OPKB)
    if let Some(our_onetime_secret) = our_onetime_secret {
        ikm.extend_from_slice(
            our_onetime_secret
                .calculate_agreement(their_ephemeral_key)?
                .as_bytes(),
        );
    }

    let shared_key: [u8; SHARED_KEY_SIZE] = {
        let salt = [0_u8; 32];
        hkdf(&salt, &ikm, &[KDF_INFO])?
    };

    drop(ikm);

    Ok(Secret::from_bytes(shared_key))
}

#[derive(Debug, Error)]
pub enum X3DHError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),
}
