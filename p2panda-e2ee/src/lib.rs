// SPDX-License-Identifier: MIT OR Apache-2.0

//! `p2panda-e2ee` provides end-to-end encrypted messaging between devices, for direct
//! conversations as well as for groups.
//!
//! Every client installation is a device with its own long-term identity key. Devices publish
//! pre-keys to a [`PrekeyDirectory`], so others can start encrypting towards them while they are
//! offline. The crate does not persist anything or talk to the network itself: storage and
//! transport are reached through the interfaces in [`traits`], with an in-memory implementation
//! in [`MemoryStore`].
//!
//! ## Pairwise sessions
//!
//! Two devices agree on a shared secret with Signal's
//! [X3DH](https://signal.org/docs/specifications/x3dh) key agreement, using the claimed pre-keys
//! of the other device. Messages are then encrypted with a [Double
//! Ratchet](https://signal.org/docs/specifications/doubleratchet), giving forward secrecy and
//! post-compromise security. Messages can arrive out of order within a bounded window.
//!
//! ## Group sessions
//!
//! For groups every sending device owns a symmetric ratchet per conversation. Each message
//! advances the ratchet and is signed with a signing key belonging to the session. The current
//! ratchet state is distributed to all members over pairwise sessions. Devices joining later only
//! receive the state from the current index and can't decrypt earlier messages.
//!
//! Sessions are replaced when the membership of a conversation changes or after a configured
//! number of messages or amount of time.
//!
//! ## Device verification
//!
//! The identity keys of remote devices are trusted on first use. Users can verify them by
//! comparing short authentication strings (SAS) with the [`verification`] handshake, after which
//! messages of the device are displayed as verified.
//!
//! ## Usage
//!
//! [`MessageCodec`] is the entry point for applications: it picks the right session for a
//! conversation, creates and distributes group sessions when needed and classifies decryption
//! failures. The lower-level session types can be used directly for custom integrations.
//!
//! All state is handed in and returned by value (see [`PairwiseSession`] and [`GroupSession`]),
//! so failed operations never leave half-updated ratchets behind. A single session must not be
//! advanced concurrently.
//!
//! ## Security
//!
//! Encryption helps to prevent your data being readable by third parties but it can never
//! guarantee full security. Meta-data like senders, recipients and conversation ids is not
//! encrypted. None of the used cryptography is post-quantum ready.
//!
//! [`PairwiseSession`]: crate::pairwise::PairwiseSession
//! [`GroupSession`]: crate::group::GroupSession
mod account;
mod cbor;
mod codec;
mod config;
mod crypto;
mod device;
mod distributor;
mod error;
pub mod group;
mod key_bundle;
mod key_store;
mod memory_store;
pub mod pairwise;
mod prekey_directory;
mod session_store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod time;
pub mod traits;
mod types;
pub mod verification;

pub use account::{Account, PublishError};
pub use cbor::{DecodeError, EncodeError};
pub use codec::{
    Algorithm, CodecError, DecryptionFailure, Envelope, GroupSessionInfo, MessageCodec,
    ReceivedMessage, SendOutcome, Topology,
};
pub use config::Config;
pub use crypto::x25519::{PublicKey, X25519Error};
pub use crypto::xeddsa::{XEdDSAError, XSignature};
pub use crypto::{Rng, RngError};
pub use device::{
    Device, DeviceAddress, DeviceError, DeviceRegistry, Trust, VerificationMethod,
};
pub use distributor::{
    ClaimError, ClaimReport, DistributionError, DistributionOutcome, SessionKeyDistributor,
    SessionShare, SkippedShare,
};
pub use error::ErrorClass;
pub use key_bundle::{
    KeyBundleError, Lifetime, LifetimeError, OneTimePreKey, OneTimePreKeyId, PreKeyId,
    PrekeyBundle, SignedPreKey,
};
pub use key_store::{KeyStore, KeyStoreError, KeyStoreState};
pub use memory_store::MemoryStore;
pub use prekey_directory::{PrekeyDirectory, PrekeyDirectoryError};
pub use time::{Timestamp, now};
pub use types::{ConversationId, IdError, MessageIndex, SessionId, ShareId};
