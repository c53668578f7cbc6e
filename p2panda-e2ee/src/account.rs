// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local state of one device: its keys, sessions and the devices it knows about.
use std::fmt::{self, Debug, Display};

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::x25519::PublicKey;
use crate::device::{DeviceAddress, DeviceRegistry};
use crate::key_store::{KeyStore, KeyStoreError, KeyStoreState};
use crate::pairwise::{PairwiseError, PairwiseMessage, PairwiseSession};
use crate::prekey_directory::{PrekeyDirectory, PrekeyDirectoryError};
use crate::session_store::SessionStore;
use crate::traits::PrekeyStore;
use crate::types::SessionId;

/// Everything a device needs to encrypt and decrypt messages.
///
/// The account holds private key material and ratchet state. None of it is reachable from the
/// public API: the account can't be serialized and its debug output only shows public values.
#[derive(Clone)]
pub struct Account {
    address: DeviceAddress,
    keys: KeyStoreState,
    sessions: SessionStore,
    devices: DeviceRegistry,
}

impl Account {
    /// Creates a new device identity with a first signed pre-key.
    pub fn new(address: DeviceAddress, config: &Config, rng: &Rng) -> Result<Self, KeyStoreError> {
        let keys = KeyStore::init(rng, config.lifetime())?;
        Ok(Self {
            address,
            keys,
            sessions: SessionStore::new(),
            devices: DeviceRegistry::new(),
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn identity_key(&self) -> PublicKey {
        KeyStore::export_public_identity(&self.keys)
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }

    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut SessionStore {
        &mut self.sessions
    }

    pub(crate) fn keys(&self) -> &KeyStoreState {
        &self.keys
    }

    /// Publishes our pre-keys to the directory.
    ///
    /// Expired signed pre-keys are removed, the signed pre-key is rotated when it became too old
    /// and a new batch of one-time pre-keys is generated when the directory runs low. Returns the
    /// number of newly published one-time pre-keys.
    pub async fn publish_prekeys<S>(
        &mut self,
        directory: &PrekeyDirectory<S>,
        config: &Config,
        rng: &Rng,
    ) -> Result<usize, PublishError<S::Error>>
    where
        S: PrekeyStore,
    {
        let mut keys = KeyStore::remove_expired(self.keys.clone());
        if KeyStore::needs_rotation(&keys, config.prekey_rotate_after().as_secs()) {
            let (keys_i, _, _) = KeyStore::rotate_signed_prekey(keys, config.lifetime(), rng)?;
            keys = keys_i;
        }

        let available = directory.onetime_prekey_count(&self.address).await?;
        let (keys, onetime_prekeys) = if available < config.onetime_prekey_low_watermark() {
            KeyStore::generate_onetime_prekeys(keys, config.onetime_prekey_batch_size(), rng)?
        } else {
            (keys, Vec::new())
        };

        let (signed_prekey, signature) = KeyStore::publication(&keys)?;
        let added = directory
            .publish(
                &self.address,
                &KeyStore::export_public_identity(&keys),
                &signed_prekey,
                &signature,
                &onetime_prekeys,
            )
            .await?;

        self.keys = keys;
        Ok(added)
    }

    /// Encrypts a message with an established pairwise session.
    pub(crate) fn encrypt_pairwise(
        &mut self,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<PairwiseMessage, PairwiseError> {
        let y = self
            .sessions
            .pairwise(session_id)
            .cloned()
            .ok_or(PairwiseError::SessionMismatch(*session_id))?;
        let (y, message) = PairwiseSession::encrypt(y, plaintext)?;
        self.sessions.update_pairwise(y);
        Ok(message)
    }

    /// Decrypts a pairwise message from `sender`, establishing the session first when needed.
    ///
    /// Sessions and consumed pre-keys are only updated when the message decrypted and the
    /// session's identity key matches the expected one.
    pub(crate) fn decrypt_pairwise(
        &mut self,
        sender: &DeviceAddress,
        expected_identity_key: &PublicKey,
        message: &PairwiseMessage,
        config: &Config,
        rng: &Rng,
    ) -> Result<Vec<u8>, PairwiseError> {
        let session_id = message.session_id();

        if let Some(y) = self.sessions.pairwise(&session_id).cloned() {
            if self.sessions.pairwise_peer(&session_id) != Some(sender)
                || y.their_identity_key() != expected_identity_key
            {
                return Err(PairwiseError::IdentityMismatch(session_id));
            }
            let (y, plaintext) = PairwiseSession::decrypt(y, message, config, rng)?;
            self.sessions.update_pairwise(y);
            return Ok(plaintext);
        }

        let (keys, y) = PairwiseSession::respond(self.keys.clone(), &message.header)?;
        if y.their_identity_key() != expected_identity_key {
            return Err(PairwiseError::IdentityMismatch(session_id));
        }
        let (y, plaintext) = PairwiseSession::decrypt(y, message, config, rng)?;

        debug!(%session_id, %sender, "accepted new pairwise session");
        self.keys = keys;
        self.sessions.insert_pairwise(sender.clone(), y);
        Ok(plaintext)
    }
}

impl Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("identity_key", &self.identity_key())
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum PublishError<E>
where
    E: Debug + Display,
{
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Directory(#[from] PrekeyDirectoryError<E>),
}
