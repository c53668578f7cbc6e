// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey};
use crate::key_bundle::{OneTimePreKeyId, PreKeyId};
use crate::types::{SESSION_ID_SIZE, SessionId};

/// Key agreement details the initiator attaches to its messages until it received a first reply.
///
/// They allow the responder to establish the session from any of these messages, even if the
/// first ones got lost.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyInfo {
    pub identity_key: PublicKey,
    pub ephemeral_key: PublicKey,
    pub signed_prekey_id: PreKeyId,
    pub onetime_prekey_id: Option<OneTimePreKeyId>,
}

/// Unencrypted header of a pairwise message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub session_id: SessionId,
    /// Current ratchet public key of the sender.
    pub ratchet_key: PublicKey,
    /// Number of messages in the sender's previous sending chain.
    pub previous_chain_length: u64,
    pub message_number: u64,
    pub prekey: Option<PreKeyInfo>,
}

impl RatchetHeader {
    /// Canonical byte representation, authenticated as associated data.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SESSION_ID_SIZE + PUBLIC_KEY_SIZE * 3 + 8 * 5 + 2);
        bytes.extend_from_slice(self.session_id.as_bytes());
        bytes.extend_from_slice(self.ratchet_key.as_bytes());
        bytes.extend_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes.extend_from_slice(&self.message_number.to_be_bytes());
        match &self.prekey {
            Some(prekey) => {
                bytes.push(1);
                bytes.extend_from_slice(prekey.identity_key.as_bytes());
                bytes.extend_from_slice(prekey.ephemeral_key.as_bytes());
                bytes.extend_from_slice(&prekey.signed_prekey_id.to_be_bytes());
                match prekey.onetime_prekey_id {
                    Some(id) => {
                        bytes.push(1);
                        bytes.extend_from_slice(&id.to_be_bytes());
                    }
                    None => bytes.push(0),
                }
            }
            None => bytes.push(0),
        }
        bytes
    }
}

/// Encrypted message sent over a pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseMessage {
    pub header: RatchetHeader,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl PairwiseMessage {
    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    /// Returns true if this message can establish a new session on the receiving side.
    pub fn is_prekey_message(&self) -> bool {
        self.header.prekey.is_some()
    }
}
