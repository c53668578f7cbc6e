// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short authentication strings users compare to verify a device.
//!
//! Both devices derive the same bytes from the shared secret of the exchange, both ephemeral
//! public keys and the transaction id. The bytes are rendered as seven emoji out of a vocabulary
//! of 64 and as three numbers between 1000 and 9191.
use crate::crypto::Secret;
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::{PublicKey, SHARED_SECRET_SIZE};
use crate::verification::message::{Commitment, Mac, TransactionId};

const SAS_BYTES: usize = 11;

const SAS_INFO: &[u8] = b"p2panda-e2ee-sas";

const MAC_INFO: &[u8] = b"p2panda-e2ee-sas-mac";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Emoji {
    pub symbol: &'static str,
    pub description: &'static str,
}

const fn emoji(symbol: &'static str, description: &'static str) -> Emoji {
    Emoji {
        symbol,
        description,
    }
}

pub const EMOJI: [Emoji; 64] = [
    emoji("🐶", "Dog"),
    emoji("🐱", "Cat"),
    emoji("🦁", "Lion"),
    emoji("🐎", "Horse"),
    emoji("🦄", "Unicorn"),
    emoji("🐷", "Pig"),
    emoji("🐘", "Elephant"),
    emoji("🐰", "Rabbit"),
    emoji("🐼", "Panda"),
    emoji("🐓", "Rooster"),
    emoji("🐧", "Penguin"),
    emoji("🐢", "Turtle"),
    emoji("🐟", "Fish"),
    emoji("🐙", "Octopus"),
    emoji("🦋", "Butterfly"),
    emoji("🌷", "Flower"),
    emoji("🌳", "Tree"),
    emoji("🌵", "Cactus"),
    emoji("🍄", "Mushroom"),
    emoji("🌏", "Globe"),
    emoji("🌙", "Moon"),
    emoji("☁️", "Cloud"),
    emoji("🔥", "Fire"),
    emoji("🍌", "Banana"),
    emoji("🍎", "Apple"),
    emoji("🍓", "Strawberry"),
    emoji("🌽", "Corn"),
    emoji("🍕", "Pizza"),
    emoji("🎂", "Cake"),
    emoji("❤️", "Heart"),
    emoji("😀", "Smiley"),
    emoji("🤖", "Robot"),
    emoji("🎩", "Hat"),
    emoji("👓", "Glasses"),
    emoji("🔧", "Spanner"),
    emoji("🎅", "Santa"),
    emoji("👍", "Thumbs Up"),
    emoji("☂️", "Umbrella"),
    emoji("⌛", "Hourglass"),
    emoji("⏰", "Clock"),
    emoji("🎁", "Gift"),
    emoji("💡", "Light Bulb"),
    emoji("📕", "Book"),
    emoji("✏️", "Pencil"),
    emoji("📎", "Paperclip"),
    emoji("✂️", "Scissors"),
    emoji("🔒", "Lock"),
    emoji("🔑", "Key"),
    emoji("🔨", "Hammer"),
    emoji("☎️", "Telephone"),
    emoji("🏁", "Flag"),
    emoji("🚂", "Train"),
    emoji("🚲", "Bicycle"),
    emoji("✈️", "Aeroplane"),
    emoji("🚀", "Rocket"),
    emoji("🏆", "Trophy"),
    emoji("⚽", "Ball"),
    emoji("🎸", "Guitar"),
    emoji("🎺", "Trumpet"),
    emoji("🔔", "Bell"),
    emoji("⚓", "Anchor"),
    emoji("🎧", "Headphones"),
    emoji("📁", "Folder"),
    emoji("📌", "Pin"),
];

/// Human-comparable rendering of a verification exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sas {
    emoji: [Emoji; 7],
    decimals: [u16; 3],
}

impl Sas {
    pub fn emoji(&self) -> &[Emoji; 7] {
        &self.emoji
    }

    pub fn decimals(&self) -> [u16; 3] {
        self.decimals
    }

    fn from_bytes(bytes: &[u8; SAS_BYTES]) -> Self {
        // First 42 of 48 bits select the emoji, six bits each.
        let bits = bytes[..6]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        let emoji = std::array::from_fn(|i| EMOJI[((bits >> (42 - 6 * i)) & 0x3f) as usize]);

        // First 39 of the remaining 40 bits are split into three numbers of 13 bits each.
        let [b0, b1, b2, b3, b4] =
            [bytes[6], bytes[7], bytes[8], bytes[9], bytes[10]].map(u16::from);
        let decimals = [
            ((b0 << 5) | (b1 >> 3)) + 1000,
            (((b1 & 0x07) << 10) | (b2 << 2) | (b3 >> 6)) + 1000,
            (((b3 & 0x3f) << 7) | (b4 >> 1)) + 1000,
        ];

        Self { emoji, decimals }
    }
}

/// Derives the short authentication string. The initiator's public key always goes first.
pub(crate) fn calculate_sas(
    shared_secret: &Secret<SHARED_SECRET_SIZE>,
    initiator_key: &PublicKey,
    responder_key: &PublicKey,
    transaction_id: &TransactionId,
) -> Result<Sas, HkdfError> {
    let info = [
        SAS_INFO,
        &initiator_key.as_bytes()[..],
        &responder_key.as_bytes()[..],
        &transaction_id.as_bytes()[..],
    ];
    let bytes: [u8; SAS_BYTES] = hkdf(b"", shared_secret.as_bytes(), &info)?;
    Ok(Sas::from_bytes(&bytes))
}

/// Hash of an ephemeral public key, sent by the initiator before revealing the key itself.
pub(crate) fn commitment(public_key: &PublicKey, transaction_id: &TransactionId) -> Commitment {
    sha2_256(&[&public_key.as_bytes()[..], &transaction_id.as_bytes()[..]])
}

/// Authenticates an identity key with the shared secret of the exchange.
///
/// The sender's ephemeral key is part of the input, so a confirmation can't be reflected back
/// to its sender.
pub(crate) fn confirmation_mac(
    shared_secret: &Secret<SHARED_SECRET_SIZE>,
    sender_key: &PublicKey,
    transaction_id: &TransactionId,
    identity_key: &PublicKey,
) -> Result<Mac, HkdfError> {
    let info = [
        MAC_INFO,
        &sender_key.as_bytes()[..],
        &transaction_id.as_bytes()[..],
    ];
    hkdf(shared_secret.as_bytes(), identity_key.as_bytes(), &info)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::verification::message::TransactionId;

    use super::{EMOJI, SAS_BYTES, Sas, calculate_sas, commitment, confirmation_mac};

    #[test]
    fn vocabulary_is_unique() {
        let symbols: HashSet<&str> = EMOJI.iter().map(|emoji| emoji.symbol).collect();
        assert_eq!(symbols.len(), 64);
    }

    #[test]
    fn bit_extraction() {
        let zeros = Sas::from_bytes(&[0; SAS_BYTES]);
        assert_eq!(zeros.decimals(), [1000, 1000, 1000]);
        assert!(zeros.emoji().iter().all(|emoji| *emoji == EMOJI[0]));

        let ones = Sas::from_bytes(&[0xff; SAS_BYTES]);
        assert_eq!(ones.decimals(), [9191, 9191, 9191]);
        assert!(ones.emoji().iter().all(|emoji| *emoji == EMOJI[63]));

        // 0b000001_000010_000011_000100_000101_000110_000111_xxxxxx
        let sas = Sas::from_bytes(&[0x04, 0x20, 0xc4, 0x14, 0x61, 0xc0, 0, 0, 0, 0, 0]);
        let indices: Vec<&str> = sas.emoji().iter().map(|emoji| emoji.description).collect();
        assert_eq!(
            indices,
            ["Cat", "Lion", "Horse", "Unicorn", "Pig", "Elephant", "Rabbit"]
        );
    }

    #[test]
    fn both_sides_derive_same_sas() {
        let rng = Rng::from_seed([1; 32]);
        let transaction_id = TransactionId::random(&rng).unwrap();

        let alice_secret = SecretKey::from_bytes(rng.random_array().unwrap());
        let alice_public = alice_secret.public_key().unwrap();
        let bob_secret = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob_public = bob_secret.public_key().unwrap();

        let alice_shared = alice_secret.calculate_agreement(&bob_public).unwrap();
        let bob_shared = bob_secret.calculate_agreement(&alice_public).unwrap();

        let alice_sas =
            calculate_sas(&alice_shared, &alice_public, &bob_public, &transaction_id).unwrap();
        let bob_sas =
            calculate_sas(&bob_shared, &alice_public, &bob_public, &transaction_id).unwrap();
        assert_eq!(alice_sas, bob_sas);

        // Different transaction, different SAS.
        let other_transaction = TransactionId::random(&rng).unwrap();
        let other_sas =
            calculate_sas(&alice_shared, &alice_public, &bob_public, &other_transaction).unwrap();
        assert_ne!(alice_sas, other_sas);
    }

    #[test]
    fn commitment_binds_key_and_transaction() {
        let rng = Rng::from_seed([2; 32]);
        let transaction_id = TransactionId::random(&rng).unwrap();
        let key_1 = SecretKey::from_bytes(rng.random_array().unwrap())
            .public_key()
            .unwrap();
        let key_2 = SecretKey::from_bytes(rng.random_array().unwrap())
            .public_key()
            .unwrap();

        assert_eq!(
            commitment(&key_1, &transaction_id),
            commitment(&key_1, &transaction_id)
        );
        assert_ne!(
            commitment(&key_1, &transaction_id),
            commitment(&key_2, &transaction_id)
        );
    }

    #[test]
    fn mac_depends_on_sender() {
        let rng = Rng::from_seed([3; 32]);
        let transaction_id = TransactionId::random(&rng).unwrap();
        let secret = SecretKey::from_bytes(rng.random_array().unwrap());
        let public = secret.public_key().unwrap();
        let other = SecretKey::from_bytes(rng.random_array().unwrap())
            .public_key()
            .unwrap();
        let shared = secret.calculate_agreement(&other).unwrap();

        let mac_1 = confirmation_mac(&shared, &public, &transaction_id, &public).unwrap();
        let mac_2 = confirmation_mac(&shared, &other, &transaction_id, &public).unwrap();
        assert_ne!(mac_1, mac_2);
    }
}
