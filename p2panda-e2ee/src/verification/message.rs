// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError};
use crate::device::DeviceAddress;

pub const TRANSACTION_ID_SIZE: usize = 16;

pub type Commitment = [u8; 32];

pub type Mac = [u8; 32];

/// Identifier of one verification handshake, shared by both devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(#[serde(with = "serde_bytes")] [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    pub(crate) fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Why a verification was cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// One of the users aborted the verification.
    User,

    /// Users reported that the short authentication strings differ.
    SasMismatch,

    /// Revealed public key does not match the initiator's commitment.
    CommitmentMismatch,

    /// Confirmed identity key is not authentic or differs from the known one.
    KeyMismatch,

    /// Verification was idle for too long.
    Timeout,

    /// Message arrived in a state where it was not expected.
    UnexpectedMessage,
}

/// Messages exchanged between two devices during a verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMessage {
    /// Initiator asks to verify and commits to its ephemeral public key.
    Start {
        transaction_id: TransactionId,
        from: DeviceAddress,
        to: DeviceAddress,
        #[serde(with = "serde_bytes")]
        commitment: Commitment,
    },

    /// Responder accepts and sends its ephemeral public key.
    Accept {
        transaction_id: TransactionId,
        public_key: PublicKey,
    },

    /// Initiator reveals the ephemeral public key it committed to.
    KeyExchange {
        transaction_id: TransactionId,
        public_key: PublicKey,
    },

    /// User confirmed matching strings, authenticating the sender's identity key.
    Confirm {
        transaction_id: TransactionId,
        identity_key: PublicKey,
        #[serde(with = "serde_bytes")]
        mac: Mac,
    },

    Cancel {
        transaction_id: TransactionId,
        reason: CancelReason,
    },
}

impl VerificationMessage {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            VerificationMessage::Start { transaction_id, .. }
            | VerificationMessage::Accept { transaction_id, .. }
            | VerificationMessage::KeyExchange { transaction_id, .. }
            | VerificationMessage::Confirm { transaction_id, .. }
            | VerificationMessage::Cancel { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}
