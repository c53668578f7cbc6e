// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender-owned forward ratchet for broadcasting messages into a conversation.
//!
//! The sending device creates an outbound session with a random chain key and signing key. Every
//! message advances the chain by one step:
//!
//! ```text
//! chain_0 ──> chain_1 ──> chain_2 ──> ...
//!    │           │           │
//!    v           v           v
//!  key_0       key_1       key_2
//! ```
//!
//! Recipients import the chain key at some index from a session share and can only derive keys
//! from that index onwards. This way members who joined later can not read earlier messages.
//!
//! Sessions are never mutated on membership changes. The sender supersedes the session and
//! distributes a new one instead.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::xchacha20::{XAeadError, XAeadNonce, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::xeddsa::{XEdDSAError, xeddsa_sign, xeddsa_verify};
use crate::crypto::{Rng, RngError, Secret};
use crate::device::DeviceAddress;
use crate::error::ErrorClass;
use crate::group::message::{GROUP_CHAIN_KEY_SIZE, GroupMessage, GroupSessionKey};
use crate::time::{Timestamp, now};
use crate::types::{ConversationId, MessageIndex, SessionId};

pub const GROUP_MESSAGE_KEY_SIZE: usize = 32;

pub struct GroupSession;

/// State of a group session on the sending device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundGroupSessionState {
    session_id: SessionId,
    conversation_id: ConversationId,
    chain_key: Secret<GROUP_CHAIN_KEY_SIZE>,
    message_index: MessageIndex,
    signing_secret: SecretKey,
    signing_key: PublicKey,
    recipients: BTreeSet<DeviceAddress>,
    created_at: Timestamp,
    superseded: bool,
}

impl OutboundGroupSessionState {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Index the next message will be encrypted with.
    pub fn message_index(&self) -> MessageIndex {
        self.message_index
    }

    pub fn recipients(&self) -> &BTreeSet<DeviceAddress> {
        &self.recipients
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }
}

/// Read-only state of a group session on a receiving device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundGroupSessionState {
    session_id: SessionId,
    conversation_id: ConversationId,
    sender: DeviceAddress,
    sender_identity_key: PublicKey,
    signing_key: PublicKey,
    first_known_index: MessageIndex,
    initial_chain_key: Secret<GROUP_CHAIN_KEY_SIZE>,
    latest_index: MessageIndex,
    latest_chain_key: Secret<GROUP_CHAIN_KEY_SIZE>,
    decrypted: BTreeSet<MessageIndex>,
    replay_floor: MessageIndex,
}

impl InboundGroupSessionState {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn sender(&self) -> &DeviceAddress {
        &self.sender
    }

    pub fn sender_identity_key(&self) -> &PublicKey {
        &self.sender_identity_key
    }

    /// Earliest message index this device is entitled to decrypt.
    pub fn first_known_index(&self) -> MessageIndex {
        self.first_known_index
    }

    /// Takes over the already decrypted indices of an older copy of the same session, so
    /// re-importing a session never opens it up for replays.
    pub(crate) fn keep_decrypted(mut self, other: &InboundGroupSessionState) -> Self {
        self.decrypted.extend(other.decrypted.iter().copied());
        self.replay_floor = self.replay_floor.max(other.replay_floor);
        self
    }
}

impl GroupSession {
    /// Creates a new session for a conversation, owned by this device.
    pub fn create_as_sender(
        conversation_id: ConversationId,
        recipients: BTreeSet<DeviceAddress>,
        rng: &Rng,
    ) -> GroupSessionResult<OutboundGroupSessionState> {
        let session_id = SessionId::random(rng)?;
        let chain_key = Secret::from_bytes(rng.random_array()?);
        let signing_secret = SecretKey::from_bytes(rng.random_array()?);
        let signing_key = signing_secret.public_key()?;

        debug!(
            %session_id,
            %conversation_id,
            recipients = recipients.len(),
            "created outbound group session"
        );

        Ok(OutboundGroupSessionState {
            session_id,
            conversation_id,
            chain_key,
            message_index: 0,
            signing_secret,
            signing_key,
            recipients,
            created_at: now(),
            superseded: false,
        })
    }

    /// Encrypts and signs a message at the current index and advances the ratchet.
    pub fn encrypt(
        mut y: OutboundGroupSessionState,
        plaintext: &[u8],
        rng: &Rng,
    ) -> GroupSessionResult<(OutboundGroupSessionState, GroupMessage)> {
        if y.superseded {
            return Err(GroupSessionError::Superseded(y.session_id));
        }

        let message_index = y.message_index;
        let message_key = message_key(&y.chain_key)?;

        let ciphertext = {
            let nonce: XAeadNonce = hkdf(b"nonce", message_key.as_bytes(), &[])?;
            let ad = associated_data(&y.session_id, message_index);
            x_aead_encrypt(message_key.as_bytes(), plaintext, nonce, Some(&ad))?
        };

        let signature = xeddsa_sign(
            &GroupMessage::to_signed_bytes(&y.session_id, message_index, &ciphertext),
            &y.signing_secret,
            rng,
        )?;

        y.chain_key = next_chain_key(&y.chain_key)?;
        y.message_index += 1;

        let session_id = y.session_id;
        Ok((
            y,
            GroupMessage {
                session_id,
                message_index,
                ciphertext,
                signature,
            },
        ))
    }

    /// Exports the ratchet state at the current index for distribution to recipients.
    pub fn export_key(y: &OutboundGroupSessionState) -> GroupSessionKey {
        GroupSessionKey {
            session_id: y.session_id,
            conversation_id: y.conversation_id.clone(),
            message_index: y.message_index,
            chain_key: y.chain_key.clone(),
            signing_key: y.signing_key,
        }
    }

    /// Marks the session as superseded. It can't be used for encryption anymore, messages
    /// already sent under it stay decryptable for recipients.
    pub fn supersede(mut y: OutboundGroupSessionState) -> OutboundGroupSessionState {
        debug!(session_id = %y.session_id, "supersede outbound group session");
        y.superseded = true;
        y
    }

    /// Returns true if the session should be replaced by a new one before sending, because it is
    /// superseded or passed one of the configured rotation limits.
    pub fn needs_rotation(
        y: &OutboundGroupSessionState,
        config: &Config,
        now: Timestamp,
    ) -> bool {
        y.superseded
            || y.message_index >= config.group_rotation_messages
            || now >= y.created_at.saturating_add(config.group_rotation_period.as_secs())
    }

    /// Imports a session key received from another device.
    pub fn import_from_share(
        key: GroupSessionKey,
        sender: DeviceAddress,
        sender_identity_key: PublicKey,
    ) -> InboundGroupSessionState {
        debug!(
            session_id = %key.session_id,
            conversation_id = %key.conversation_id,
            %sender,
            first_known_index = key.message_index,
            "imported inbound group session"
        );

        InboundGroupSessionState {
            session_id: key.session_id,
            conversation_id: key.conversation_id,
            sender,
            sender_identity_key,
            signing_key: key.signing_key,
            first_known_index: key.message_index,
            initial_chain_key: key.chain_key.clone(),
            latest_index: key.message_index,
            latest_chain_key: key.chain_key,
            decrypted: BTreeSet::new(),
            replay_floor: 0,
        }
    }

    /// Decrypts a message of this session.
    ///
    /// Keys are only derived forward, either from the initial chain key or from the latest one
    /// we've seen. Indices before the first known index fail without any derivation.
    ///
    /// Every index decrypts once. The session remembers the latest decrypted indices up to the
    /// configured replay window and rejects anything older than those.
    pub fn decrypt(
        mut y: InboundGroupSessionState,
        message: &GroupMessage,
        config: &Config,
    ) -> GroupSessionResult<(InboundGroupSessionState, Vec<u8>)> {
        if message.session_id != y.session_id {
            return Err(GroupSessionError::UnknownSession(message.session_id));
        }

        if message.message_index < y.first_known_index {
            return Err(GroupSessionError::BeforeJoinWindow(
                y.session_id,
                message.message_index,
                y.first_known_index,
            ));
        }

        if message.message_index < y.replay_floor || y.decrypted.contains(&message.message_index) {
            return Err(GroupSessionError::Replayed(y.session_id, message.message_index));
        }

        let (base_index, base_chain_key) = if message.message_index >= y.latest_index {
            (y.latest_index, &y.latest_chain_key)
        } else {
            (y.first_known_index, &y.initial_chain_key)
        };

        if message.message_index - base_index > config.max_group_index_jump {
            return Err(GroupSessionError::IndexOutOfRange(
                y.session_id,
                message.message_index,
                base_index,
            ));
        }

        if let Err(err) = xeddsa_verify(
            &GroupMessage::to_signed_bytes(
                &message.session_id,
                message.message_index,
                &message.ciphertext,
            ),
            &y.signing_key,
            &message.signature,
        ) {
            warn!(session_id = %y.session_id, "group message signature is invalid: {err}");
            return Err(GroupSessionError::AuthenticationFailed(y.session_id));
        }

        let mut chain_key = base_chain_key.clone();
        for _ in base_index..message.message_index {
            chain_key = next_chain_key(&chain_key)?;
        }

        let message_key = message_key(&chain_key)?;
        let nonce: XAeadNonce = hkdf(b"nonce", message_key.as_bytes(), &[])?;
        let ad = associated_data(&y.session_id, message.message_index);
        let plaintext = x_aead_decrypt(
            message_key.as_bytes(),
            &message.ciphertext,
            nonce,
            Some(&ad),
        )
        .map_err(|err| {
            warn!(session_id = %y.session_id, "group message failed to authenticate: {err}");
            GroupSessionError::AuthenticationFailed(y.session_id)
        })?;

        // Cache the chain after the latest decrypted message to keep future derivations short.
        if message.message_index >= y.latest_index {
            y.latest_chain_key = next_chain_key(&chain_key)?;
            y.latest_index = message.message_index + 1;
        }

        y.decrypted.insert(message.message_index);
        while y.decrypted.len() > config.group_replay_window {
            if let Some(oldest) = y.decrypted.pop_first() {
                y.replay_floor = oldest + 1;
            }
        }

        Ok((y, plaintext))
    }
}

fn message_key(
    chain_key: &Secret<GROUP_CHAIN_KEY_SIZE>,
) -> GroupSessionResult<Secret<GROUP_MESSAGE_KEY_SIZE>> {
    Ok(Secret::from_bytes(hkdf(b"message", chain_key.as_bytes(), &[])?))
}

fn next_chain_key(
    chain_key: &Secret<GROUP_CHAIN_KEY_SIZE>,
) -> GroupSessionResult<Secret<GROUP_CHAIN_KEY_SIZE>> {
    Ok(Secret::from_bytes(hkdf(b"chain", chain_key.as_bytes(), &[])?))
}

fn associated_data(session_id: &SessionId, message_index: MessageIndex) -> Vec<u8> {
    let mut ad = session_id.as_bytes().to_vec();
    ad.extend_from_slice(&message_index.to_be_bytes());
    ad
}

pub type GroupSessionResult<T> = Result<T, GroupSessionError>;

#[derive(Debug, Error)]
pub enum GroupSessionError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    XEdDSA(#[from] XEdDSAError),

    #[error("group session {0} is not known")]
    UnknownSession(SessionId),

    #[error("message {1} of group session {0} was sent before we joined at index {2}")]
    BeforeJoinWindow(SessionId, MessageIndex, MessageIndex),

    #[error("message {1} of group session {0} is too far ahead of index {2}")]
    IndexOutOfRange(SessionId, MessageIndex, MessageIndex),

    #[error("message {1} of group session {0} was decrypted already or is too old")]
    Replayed(SessionId, MessageIndex),

    #[error("message of group session {0} failed to authenticate")]
    AuthenticationFailed(SessionId),

    #[error("group session {0} was superseded and can't encrypt anymore")]
    Superseded(SessionId),
}

impl GroupSessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GroupSessionError::Rng(_)
            | GroupSessionError::Hkdf(_)
            | GroupSessionError::X25519(_)
            | GroupSessionError::XAead(_)
            | GroupSessionError::XEdDSA(_) => ErrorClass::Fatal,
            GroupSessionError::UnknownSession(_)
            | GroupSessionError::BeforeJoinWindow(_, _, _)
            | GroupSessionError::IndexOutOfRange(_, _, _)
            | GroupSessionError::Replayed(_, _)
            | GroupSessionError::Superseded(_) => ErrorClass::SessionState,
            GroupSessionError::AuthenticationFailed(_) => ErrorClass::Authentication,
        }
    }
}
