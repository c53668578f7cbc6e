// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::Secret;
use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::XSignature;
use crate::types::{ConversationId, MessageIndex, SessionId};

pub const GROUP_CHAIN_KEY_SIZE: usize = 32;

/// Message encrypted with a group session, signed by the session's signing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub session_id: SessionId,
    pub message_index: MessageIndex,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub signature: XSignature,
}

impl GroupMessage {
    pub(crate) fn to_signed_bytes(
        session_id: &SessionId,
        message_index: MessageIndex,
        ciphertext: &[u8],
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(session_id.as_bytes().len() + 8 + ciphertext.len());
        bytes.extend_from_slice(session_id.as_bytes());
        bytes.extend_from_slice(&message_index.to_be_bytes());
        bytes.extend_from_slice(ciphertext);
        bytes
    }
}

/// Ratchet state of a group session at a given index, handed to recipients so they can decrypt
/// all messages from that index onwards.
///
/// Contains secret key material and is only ever sent encrypted over a pairwise session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSessionKey {
    pub(crate) session_id: SessionId,
    pub(crate) conversation_id: ConversationId,
    pub(crate) message_index: MessageIndex,
    pub(crate) chain_key: Secret<GROUP_CHAIN_KEY_SIZE>,
    pub(crate) signing_key: PublicKey,
}

impl GroupSessionKey {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// First index which can be decrypted with this key.
    pub fn message_index(&self) -> MessageIndex {
        self.message_index
    }

    pub fn signing_key(&self) -> &PublicKey {
        &self.signing_key
    }
}
