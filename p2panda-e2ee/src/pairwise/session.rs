// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet session between exactly two devices.
//!
//! The session is bootstrapped with X3DH and continues with a Diffie-Hellman ratchet: every time
//! a new ratchet key of the other party is seen, both the receiving and sending chains are
//! re-derived from the root key. Within a chain every message advances a symmetric KDF chain, so
//! no message key is ever used twice and earlier chain keys can not be recovered from later ones.
//!
//! Lost or out-of-order messages are handled by keeping the keys of skipped messages around, up
//! to a configured bound.
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::xchacha20::{XAeadError, XAeadNonce, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Rng, RngError, Secret};
use crate::error::ErrorClass;
use crate::key_bundle::{KeyBundleError, PrekeyBundle};
use crate::key_store::{KeyStore, KeyStoreError, KeyStoreState};
use crate::pairwise::message::{PairwiseMessage, PreKeyInfo, RatchetHeader};
use crate::pairwise::x3dh::{X3DHError, X3DHInitiation, x3dh_initiate, x3dh_respond};
use crate::time::{Timestamp, now};
use crate::types::{SESSION_ID_SIZE, SessionId};

pub const ROOT_KEY_SIZE: usize = 32;

pub const CHAIN_KEY_SIZE: usize = 32;

pub const MESSAGE_KEY_SIZE: usize = 32;

const ROOT_KDF_INFO: &[u8] = b"p2panda-e2ee-root";

const SESSION_ID_PREFIX: &[u8; 20] = b"p2panda-e2ee-session";

/// Pairwise ratchet session.
pub struct PairwiseSession;

/// Serializable state of a pairwise session (for persistence).
///
/// Holds secret chain keys, must only be persisted in local, protected storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairwiseSessionState {
    session_id: SessionId,
    our_identity_key: PublicKey,
    their_identity_key: PublicKey,
    root_key: Secret<ROOT_KEY_SIZE>,
    our_ratchet_secret: SecretKey,
    our_ratchet_key: PublicKey,
    their_ratchet_key: Option<PublicKey>,
    sending_chain: Option<ChainState>,
    receiving_chain: Option<ChainState>,
    previous_chain_length: u64,
    skipped_message_keys: VecDeque<SkippedMessageKey>,
    pending_prekey: Option<PreKeyInfo>,
    created_at: Timestamp,
}

impl PairwiseSessionState {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn their_identity_key(&self) -> &PublicKey {
        &self.their_identity_key
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Returns true as long as we initiated this session and did not receive a reply yet.
    pub fn is_pending(&self) -> bool {
        self.pending_prekey.is_some()
    }

    /// Number of message keys kept for messages which did not arrive yet.
    pub fn skipped_message_keys_len(&self) -> usize {
        self.skipped_message_keys.len()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChainState {
    chain_key: Secret<CHAIN_KEY_SIZE>,
    index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    message_number: u64,
    message_key: Secret<MESSAGE_KEY_SIZE>,
}

impl PairwiseSession {
    /// Starts a new session with a remote device from its claimed pre-key bundle.
    ///
    /// The session is immediately usable for encryption. Key agreement details are attached to
    /// all messages until the remote device replied.
    pub fn initiate(
        our_keys: &KeyStoreState,
        their_prekey_bundle: &PrekeyBundle,
        rng: &Rng,
    ) -> PairwiseResult<PairwiseSessionState> {
        let our_identity_key = KeyStore::export_public_identity(our_keys);
        let their_identity_key = *their_prekey_bundle.identity_key();

        let X3DHInitiation {
            shared_key,
            ephemeral_key,
        } = x3dh_initiate(our_keys.identity_secret(), their_prekey_bundle, rng)?;

        let session_id = derive_session_id(&our_identity_key, &their_identity_key, &ephemeral_key);

        // The responder's first ratchet key is its signed pre-key.
        let their_ratchet_key = *their_prekey_bundle.signed_prekey().key();
        let our_ratchet_secret = SecretKey::from_bytes(rng.random_array()?);
        let our_ratchet_key = our_ratchet_secret.public_key()?;
        let (root_key, sending_chain) = kdf_root(
            &shared_key,
            &our_ratchet_secret.calculate_agreement(&their_ratchet_key)?,
        )?;

        debug!(
            %session_id,
            their_identity_key = %their_identity_key,
            onetime_prekey = their_prekey_bundle.onetime_prekey_id().is_some(),
            "initiated pairwise session"
        );

        Ok(PairwiseSessionState {
            session_id,
            our_identity_key,
            their_identity_key,
            root_key,
            our_ratchet_secret,
            our_ratchet_key,
            their_ratchet_key: Some(their_ratchet_key),
            sending_chain: Some(sending_chain),
            receiving_chain: None,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            pending_prekey: Some(PreKeyInfo {
                identity_key: our_identity_key,
                ephemeral_key,
                signed_prekey_id: their_prekey_bundle.signed_prekey().id(),
                onetime_prekey_id: their_prekey_bundle.onetime_prekey_id(),
            }),
            created_at: now(),
        })
    }

    /// Establishes the responder's side of a session from the header of an initiator message.
    ///
    /// This consumes the referenced one-time pre-key secret. Callers should only persist the
    /// returned key store state after the message decrypted successfully.
    pub fn respond(
        our_keys: KeyStoreState,
        header: &RatchetHeader,
    ) -> PairwiseResult<(KeyStoreState, PairwiseSessionState)> {
        let Some(prekey) = &header.prekey else {
            debug!(session_id = %header.session_id, "no key agreement details in message");
            return Err(PairwiseError::SessionMismatch(header.session_id));
        };

        let our_identity_key = KeyStore::export_public_identity(&our_keys);
        let session_id =
            derive_session_id(&prekey.identity_key, &our_identity_key, &prekey.ephemeral_key);
        if session_id != header.session_id {
            return Err(PairwiseError::SessionMismatch(header.session_id));
        }

        let our_prekey_secret =
            KeyStore::prekey_secret(&our_keys, prekey.signed_prekey_id)?.clone();
        let (our_keys, our_onetime_secret) = match prekey.onetime_prekey_id {
            Some(id) => {
                let (our_keys, secret) = KeyStore::use_onetime_secret(our_keys, id)?;
                (our_keys, Some(secret))
            }
            None => (our_keys, None),
        };

        let shared_key = x3dh_respond(
            our_keys.identity_secret(),
            &our_prekey_secret,
            our_onetime_secret.as_ref(),
            &prekey.identity_key,
            &prekey.ephemeral_key,
        )?;

        debug!(
            %session_id,
            their_identity_key = %prekey.identity_key,
            "established pairwise session as responder"
        );

        let our_ratchet_key = our_prekey_secret.public_key()?;
        let y = PairwiseSessionState {
            session_id,
            our_identity_key,
            their_identity_key: prekey.identity_key,
            root_key: shared_key,
            our_ratchet_secret: our_prekey_secret,
            our_ratchet_key,
            their_ratchet_key: None,
            sending_chain: None,
            receiving_chain: None,
            previous_chain_length: 0,
            skipped_message_keys: VecDeque::new(),
            pending_prekey: None,
            created_at: now(),
        };

        Ok((our_keys, y))
    }

    /// Encrypts a message with the next key of our sending chain.
    pub fn encrypt(
        mut y: PairwiseSessionState,
        plaintext: &[u8],
    ) -> PairwiseResult<(PairwiseSessionState, PairwiseMessage)> {
        let Some(chain) = y.sending_chain.take() else {
            return Err(PairwiseError::NoSendingChain(y.session_id));
        };

        let (next_chain, message_key) = kdf_chain(&chain)?;

        let header = RatchetHeader {
            session_id: y.session_id,
            ratchet_key: y.our_ratchet_key,
            previous_chain_length: y.previous_chain_length,
            message_number: chain.index,
            prekey: y.pending_prekey.clone(),
        };

        let ad = associated_data(&header, &y.our_identity_key, &y.their_identity_key);
        let nonce: XAeadNonce = hkdf(b"nonce", message_key.as_bytes(), &[])?;
        let ciphertext = x_aead_encrypt(message_key.as_bytes(), plaintext, nonce, Some(&ad))?;

        y.sending_chain = Some(next_chain);

        Ok((y, PairwiseMessage { header, ciphertext }))
    }

    /// Decrypts a message of this session.
    ///
    /// The given state is consumed and only a successful decryption returns the advanced state.
    /// Callers keep their previous copy to continue with when decryption failed.
    pub fn decrypt(
        y: PairwiseSessionState,
        message: &PairwiseMessage,
        config: &Config,
        rng: &Rng,
    ) -> PairwiseResult<(PairwiseSessionState, Vec<u8>)> {
        let mut y = y;
        let header = &message.header;

        if header.session_id != y.session_id {
            return Err(PairwiseError::SessionMismatch(header.session_id));
        }

        // Message from the past for which we kept a skipped key.
        let skipped_position = y.skipped_message_keys.iter().position(|skipped| {
            skipped.ratchet_key == header.ratchet_key
                && skipped.message_number == header.message_number
        });
        if let Some(skipped) =
            skipped_position.and_then(|position| y.skipped_message_keys.remove(position))
        {
            let plaintext = Self::decrypt_inner(&y, &skipped.message_key, message)?;
            y.pending_prekey = None;
            return Ok((y, plaintext));
        }

        // The other party moved its ratchet forward.
        if y.their_ratchet_key != Some(header.ratchet_key) {
            y = Self::skip_message_keys(y, header.previous_chain_length, config)?;
            y = Self::dh_ratchet(y, &header.ratchet_key, rng)?;
        }

        match &y.receiving_chain {
            Some(chain) if header.message_number >= chain.index => (),
            _ => {
                debug!(
                    session_id = %y.session_id,
                    message_number = header.message_number,
                    "message was already received or its key is not available anymore"
                );
                return Err(PairwiseError::SessionMismatch(y.session_id));
            }
        }

        y = Self::skip_message_keys(y, header.message_number, config)?;

        let Some(chain) = y.receiving_chain.take() else {
            return Err(PairwiseError::SessionMismatch(y.session_id));
        };
        let (next_chain, message_key) = kdf_chain(&chain)?;
        let plaintext = Self::decrypt_inner(&y, &message_key, message)?;

        y.receiving_chain = Some(next_chain);
        y.pending_prekey = None;

        Ok((y, plaintext))
    }

    fn decrypt_inner(
        y: &PairwiseSessionState,
        message_key: &Secret<MESSAGE_KEY_SIZE>,
        message: &PairwiseMessage,
    ) -> PairwiseResult<Vec<u8>> {
        let ad = associated_data(&message.header, &y.their_identity_key, &y.our_identity_key);
        let nonce: XAeadNonce = hkdf(b"nonce", message_key.as_bytes(), &[])?;
        x_aead_decrypt(message_key.as_bytes(), &message.ciphertext, nonce, Some(&ad)).map_err(
            |err| {
                warn!(session_id = %y.session_id, "pairwise message failed to authenticate: {err}");
                PairwiseError::AuthenticationFailed(y.session_id)
            },
        )
    }

    /// Moves the receiving chain forward until `until`, keeping the keys of all skipped messages.
    fn skip_message_keys(
        mut y: PairwiseSessionState,
        until: u64,
        config: &Config,
    ) -> PairwiseResult<PairwiseSessionState> {
        let (Some(mut chain), Some(ratchet_key)) = (y.receiving_chain.take(), y.their_ratchet_key)
        else {
            return Ok(y);
        };

        if until > chain.index.saturating_add(config.max_skip) {
            debug!(
                session_id = %y.session_id,
                index = chain.index,
                until,
                "message skips too far ahead in chain"
            );
            return Err(PairwiseError::SessionMismatch(y.session_id));
        }

        while chain.index < until {
            let (next_chain, message_key) = kdf_chain(&chain)?;
            y.skipped_message_keys.push_back(SkippedMessageKey {
                ratchet_key,
                message_number: chain.index,
                message_key,
            });
            chain = next_chain;
        }

        // Evict oldest keys first.
        while y.skipped_message_keys.len() > config.max_skipped_message_keys {
            y.skipped_message_keys.pop_front();
        }

        y.receiving_chain = Some(chain);
        Ok(y)
    }

    fn dh_ratchet(
        mut y: PairwiseSessionState,
        their_ratchet_key: &PublicKey,
        rng: &Rng,
    ) -> PairwiseResult<PairwiseSessionState> {
        y.previous_chain_length = y
            .sending_chain
            .as_ref()
            .map(|chain| chain.index)
            .unwrap_or(0);
        y.their_ratchet_key = Some(*their_ratchet_key);

        let (root_key, receiving_chain) = kdf_root(
            &y.root_key,
            &y.our_ratchet_secret.calculate_agreement(their_ratchet_key)?,
        )?;

        let our_ratchet_secret = SecretKey::from_bytes(rng.random_array()?);
        let (root_key, sending_chain) = kdf_root(
            &root_key,
            &our_ratchet_secret.calculate_agreement(their_ratchet_key)?,
        )?;

        y.our_ratchet_key = our_ratchet_secret.public_key()?;
        y.our_ratchet_secret = our_ratchet_secret;
        y.root_key = root_key;
        y.receiving_chain = Some(receiving_chain);
        y.sending_chain = Some(sending_chain);

        Ok(y)
    }
}

fn derive_session_id(
    initiator_identity_key: &PublicKey,
    responder_identity_key: &PublicKey,
    ephemeral_key: &PublicKey,
) -> SessionId {
    let digest = sha2_256(&[
        SESSION_ID_PREFIX,
        initiator_identity_key.as_bytes(),
        responder_identity_key.as_bytes(),
        ephemeral_key.as_bytes(),
    ]);
    let mut bytes = [0u8; SESSION_ID_SIZE];
    bytes.copy_from_slice(&digest[..SESSION_ID_SIZE]);
    SessionId::from_bytes(bytes)
}

fn kdf_root(
    root_key: &Secret<ROOT_KEY_SIZE>,
    dh_output: &Secret<32>,
) -> PairwiseResult<(Secret<ROOT_KEY_SIZE>, ChainState)> {
    let okm: [u8; ROOT_KEY_SIZE + CHAIN_KEY_SIZE] =
        hkdf(root_key.as_bytes(), dh_output.as_bytes(), &[ROOT_KDF_INFO])?;

    let mut next_root_key = [0u8; ROOT_KEY_SIZE];
    next_root_key.copy_from_slice(&okm[..ROOT_KEY_SIZE]);
    let mut chain_key = [0u8; CHAIN_KEY_SIZE];
    chain_key.copy_from_slice(&okm[ROOT_KEY_SIZE..]);

    Ok((
        Secret::from_bytes(next_root_key),
        ChainState {
            chain_key: Secret::from_bytes(chain_key),
            index: 0,
        },
    ))
}

fn kdf_chain(chain: &ChainState) -> PairwiseResult<(ChainState, Secret<MESSAGE_KEY_SIZE>)> {
    let message_key: [u8; MESSAGE_KEY_SIZE] = hkdf(b"message", chain.chain_key.as_bytes(), &[])?;
    let chain_key: [u8; CHAIN_KEY_SIZE] = hkdf(b"chain", chain.chain_key.as_bytes(), &[])?;
    Ok((
        ChainState {
            chain_key: Secret::from_bytes(chain_key),
            index: chain.index + 1,
        },
        Secret::from_bytes(message_key),
    ))
}

fn associated_data(
    header: &RatchetHeader,
    sender_identity_key: &PublicKey,
    receiver_identity_key: &PublicKey,
) -> Vec<u8> {
    let mut ad = header.to_bytes();
    ad.extend_from_slice(sender_identity_key.as_bytes());
    ad.extend_from_slice(receiver_identity_key.as_bytes());
    ad
}

pub type PairwiseResult<T> = Result<T, PairwiseError>;

#[derive(Debug, Error)]
pub enum PairwiseError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    X3DH(#[from] X3DHError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error("message can not be derived from pairwise session {0}")]
    SessionMismatch(SessionId),

    #[error("message of pairwise session {0} failed to authenticate")]
    AuthenticationFailed(SessionId),

    #[error("pairwise session {0} can not send before receiving a first message")]
    NoSendingChain(SessionId),

    #[error("identity key of pairwise session {0} does not match the expected sender")]
    IdentityMismatch(SessionId),
}

impl PairwiseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PairwiseError::Rng(_) | PairwiseError::Hkdf(_) | PairwiseError::XAead(_) => {
                ErrorClass::Fatal
            }
            PairwiseError::X25519(_) => ErrorClass::ProtocolViolation,
            PairwiseError::X3DH(err) => match err {
                X3DHError::Rng(_) | X3DHError::Hkdf(_) => ErrorClass::Fatal,
                X3DHError::X25519(_) | X3DHError::KeyBundle(KeyBundleError::XEdDSA(_)) => {
                    ErrorClass::ProtocolViolation
                }
                X3DHError::KeyBundle(KeyBundleError::Lifetime(_)) => ErrorClass::KeyAvailability,
            },
            // Unknown pre-key secrets mean the message references keys we don't have (anymore),
            // only a new session can help.
            PairwiseError::KeyStore(
                KeyStoreError::UnknownOneTimeSecret(_) | KeyStoreError::UnknownPreKeySecret(_),
            ) => ErrorClass::SessionState,
            PairwiseError::KeyStore(err) => err.class(),
            PairwiseError::SessionMismatch(_) | PairwiseError::NoSendingChain(_) => {
                ErrorClass::SessionState
            }
            PairwiseError::AuthenticationFailed(_) => ErrorClass::Authentication,
            PairwiseError::IdentityMismatch(_) => ErrorClass::ProtocolViolation,
        }
    }
}
