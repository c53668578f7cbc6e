// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public entry point for encrypting and decrypting conversation messages.
//!
//! The codec picks the algorithm from the conversation topology: messages to a single device use
//! the pairwise session with it, messages to a group use the conversation's current group
//! session, which gets created and distributed on demand.
//!
//! Decryption failures are reported as [`DecryptionFailure`], which looks the same to users for
//! every cause. The specific reason is only logged.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::account::{Account, PublishError};
use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::config::Config;
use crate::crypto::Rng;
use crate::crypto::x25519::PublicKey;
use crate::device::{DeviceAddress, DeviceRegistry, Trust};
use crate::distributor::{
    ClaimReport, DistributionError, DistributionOutcome, SessionKeyDistributor,
};
use crate::error::ErrorClass;
use crate::group::{GroupMessage, GroupSession, GroupSessionError};
use crate::pairwise::{PairwiseError, PairwiseMessage};
use crate::prekey_directory::{PrekeyDirectory, PrekeyDirectoryError};
use crate::time::now;
use crate::traits::{PrekeyProvider, PrekeyStore, ShareMailbox};
use crate::types::{ConversationId, MessageIndex, SessionId};

/// Who takes part in a conversation, decided by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Conversation with exactly one other device.
    Pairwise { peer: DeviceAddress },

    /// Conversation with any number of devices. Our own device may be included, it is ignored.
    Group { members: Vec<DeviceAddress> },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Pairwise,
    Group,
}

/// Encrypted message as it travels over the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    algorithm: Algorithm,
    sender_user_id: String,
    sender_device_id: String,
    sender_key: PublicKey,
    session_id: SessionId,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_index: Option<MessageIndex>,
}

impl Envelope {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sender(&self) -> DeviceAddress {
        DeviceAddress::new(&self.sender_user_id, &self.sender_device_id)
    }

    /// Identity key of the sending device.
    pub fn sender_key(&self) -> &PublicKey {
        &self.sender_key
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Index of the message in its group session, only set for group messages.
    pub fn message_index(&self) -> Option<MessageIndex> {
        self.message_index
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}

/// Result of sending a message.
#[derive(Debug)]
pub enum SendOutcome<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    Encrypted {
        envelope: Envelope,
        /// Per-device results when a new group session had to be distributed.
        distribution: Vec<DistributionOutcome<P, M>>,
    },

    /// No recipient exposed any key material and the configuration allows sending without
    /// encryption. The caller is responsible for sending and marking it as such.
    Unencrypted { plaintext: Vec<u8> },
}

/// Decrypted message together with its sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub plaintext: Vec<u8>,
    pub sender: DeviceAddress,
    pub trust: Trust,
}

/// Classified, display-safe decryption failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum DecryptionFailure {
    /// We don't have (or lost) the session for this message. Requesting a fresh session share
    /// from the sender can help.
    #[error("unable to decrypt message")]
    SessionUnavailable,

    /// The message can never be decrypted by us.
    #[error("unable to decrypt message")]
    Undecryptable,
}

impl From<ErrorClass> for DecryptionFailure {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::SessionState | ErrorClass::KeyAvailability => {
                DecryptionFailure::SessionUnavailable
            }
            ErrorClass::Authentication | ErrorClass::ProtocolViolation | ErrorClass::Fatal => {
                DecryptionFailure::Undecryptable
            }
        }
    }
}

/// Public view on a group session we can decrypt messages of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSessionInfo {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub sender: DeviceAddress,
    /// Earliest message index we are entitled to decrypt.
    pub first_known_index: MessageIndex,
}

/// Encryption and decryption of conversation messages for one device.
///
/// The codec owns the account of the device. Keys and session state never leave it, only public
/// values and the registry of known devices are accessible.
#[derive(Debug)]
pub struct MessageCodec<P, M> {
    account: Account,
    config: Config,
    rng: Rng,
    directory: P,
    mailbox: M,
}

impl<P, M> MessageCodec<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub fn new(account: Account, config: Config, rng: Rng, directory: P, mailbox: M) -> Self {
        Self {
            account,
            config,
            rng,
            directory,
            mailbox,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        self.account.address()
    }

    pub fn identity_key(&self) -> PublicKey {
        self.account.identity_key()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        self.account.devices()
    }

    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        self.account.devices_mut()
    }

    /// Id of the group session we currently send with in a conversation.
    pub fn outbound_group_session(&self, conversation_id: &ConversationId) -> Option<SessionId> {
        self.account
            .sessions()
            .outbound_group(conversation_id)
            .map(|y| y.session_id())
    }

    pub fn inbound_group_session(&self, session_id: &SessionId) -> Option<GroupSessionInfo> {
        self.account
            .sessions()
            .inbound_group(session_id)
            .map(|y| GroupSessionInfo {
                session_id: y.session_id(),
                conversation_id: y.conversation_id().clone(),
                sender: y.sender().clone(),
                first_known_index: y.first_known_index(),
            })
    }

    /// Id of the pairwise session we currently send with to a device.
    pub fn pairwise_session(&self, peer: &DeviceAddress) -> Option<SessionId> {
        self.account
            .sessions()
            .current_pairwise(peer)
            .map(|y| y.session_id())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Encrypts a message for a conversation.
    pub async fn send(
        &mut self,
        conversation_id: &ConversationId,
        plaintext: &[u8],
        topology: &Topology,
    ) -> Result<SendOutcome<P, M>, CodecError<P, M>> {
        match topology {
            Topology::Pairwise { peer } => {
                self.send_pairwise(conversation_id, plaintext, peer).await
            }
            Topology::Group { members } => {
                self.send_group(conversation_id, plaintext, members).await
            }
        }
    }

    async fn send_pairwise(
        &mut self,
        conversation_id: &ConversationId,
        plaintext: &[u8],
        peer: &DeviceAddress,
    ) -> Result<SendOutcome<P, M>, CodecError<P, M>> {
        let distributor =
            SessionKeyDistributor::new(&self.directory, &self.mailbox, &self.config, &self.rng);

        let session_id = match distributor.resolve_pairwise(&mut self.account, peer).await {
            Ok(session_id) => session_id,
            Err(err) if is_missing_key_material(&err) => {
                warn!(%peer, "peer does not expose key material: {err}");
                return self.unencrypted_fallback(conversation_id, plaintext);
            }
            Err(err) => return Err(err.into()),
        };

        let message = self.account.encrypt_pairwise(&session_id, plaintext)?;
        let envelope = self.envelope(
            Algorithm::Pairwise,
            session_id,
            encode_cbor(&message)?,
            None,
        );

        Ok(SendOutcome::Encrypted {
            envelope,
            distribution: Vec::new(),
        })
    }

    async fn send_group(
        &mut self,
        conversation_id: &ConversationId,
        plaintext: &[u8],
        members: &[DeviceAddress],
    ) -> Result<SendOutcome<P, M>, CodecError<P, M>> {
        let recipients: BTreeSet<DeviceAddress> = members
            .iter()
            .filter(|member| {
                *member != self.account.address() && !self.account.devices().is_retired(member)
            })
            .cloned()
            .collect();

        let current = self
            .account
            .sessions()
            .outbound_group(conversation_id)
            .cloned();
        let needs_new_session = match &current {
            Some(y) => {
                y.recipients() != &recipients
                    || GroupSession::needs_rotation(y, &self.config, now())
            }
            None => true,
        };

        let mut distribution = Vec::new();
        let y = match current {
            Some(y) if !needs_new_session => y,
            _ => {
                let y =
                    GroupSession::create_as_sender(conversation_id.clone(), recipients, &self.rng)?;

                let distributor = SessionKeyDistributor::new(
                    &self.directory,
                    &self.mailbox,
                    &self.config,
                    &self.rng,
                );
                let recipients: Vec<DeviceAddress> = y.recipients().iter().cloned().collect();
                distribution = distributor
                    .distribute(&mut self.account, &y, &recipients)
                    .await;

                if !distribution.is_empty()
                    && distribution.iter().all(|outcome| match &outcome.result {
                        Ok(_) => false,
                        Err(err) => is_missing_key_material(err),
                    })
                {
                    warn!(%conversation_id, "no member exposes key material");
                    return self.unencrypted_fallback(conversation_id, plaintext);
                }

                // Keep our own copy to read our messages when they come back to us.
                let own_copy = GroupSession::import_from_share(
                    GroupSession::export_key(&y),
                    self.account.address().clone(),
                    self.account.identity_key(),
                );
                self.account
                    .sessions_mut()
                    .insert_inbound_group(own_copy);

                debug!(
                    %conversation_id,
                    session_id = %y.session_id(),
                    delivered = distribution.iter().filter(|outcome| outcome.is_ok()).count(),
                    failed = distribution.iter().filter(|outcome| !outcome.is_ok()).count(),
                    "distributed new group session"
                );

                y
            }
        };

        let (y, message) = GroupSession::encrypt(y, plaintext, &self.rng)?;
        let session_id = y.session_id();
        let message_index = message.message_index;
        self.account.sessions_mut().set_outbound_group(y);

        let envelope = self.envelope(
            Algorithm::Group,
            session_id,
            encode_cbor(&message)?,
            Some(message_index),
        );

        Ok(SendOutcome::Encrypted {
            envelope,
            distribution,
        })
    }

    fn unencrypted_fallback(
        &self,
        conversation_id: &ConversationId,
        plaintext: &[u8],
    ) -> Result<SendOutcome<P, M>, CodecError<P, M>> {
        if !self.config.unencrypted_fallback {
            return Err(CodecError::NoKeyMaterial(conversation_id.clone()));
        }
        warn!(%conversation_id, "sending message without encryption");
        Ok(SendOutcome::Unencrypted {
            plaintext: plaintext.to_vec(),
        })
    }

    fn envelope(
        &self,
        algorithm: Algorithm,
        session_id: SessionId,
        ciphertext: Vec<u8>,
        message_index: Option<MessageIndex>,
    ) -> Envelope {
        let address = self.account.address();
        Envelope {
            algorithm,
            sender_user_id: address.user_id().to_string(),
            sender_device_id: address.device_id().to_string(),
            sender_key: self.account.identity_key(),
            session_id,
            ciphertext,
            message_index,
        }
    }

    /// Sends the current group session of a conversation to the given devices again, for
    /// example when an earlier distribution to them failed.
    ///
    /// The devices can decrypt messages from the current index onwards.
    pub async fn reshare(
        &mut self,
        conversation_id: &ConversationId,
        devices: &[DeviceAddress],
    ) -> Result<Vec<DistributionOutcome<P, M>>, CodecError<P, M>> {
        let y = self
            .account
            .sessions()
            .outbound_group(conversation_id)
            .cloned()
            .ok_or_else(|| CodecError::NoGroupSession(conversation_id.clone()))?;

        let distributor =
            SessionKeyDistributor::new(&self.directory, &self.mailbox, &self.config, &self.rng);
        Ok(distributor.distribute(&mut self.account, &y, devices).await)
    }

    /// Imports all session shares addressed to our device.
    pub async fn claim_pending(&mut self) -> Result<ClaimReport, CodecError<P, M>> {
        let distributor =
            SessionKeyDistributor::new(&self.directory, &self.mailbox, &self.config, &self.rng);
        Ok(distributor.claim_pending(&mut self.account).await?)
    }

    /// Decrypts a message of a conversation.
    pub async fn receive(
        &mut self,
        conversation_id: &ConversationId,
        envelope: &Envelope,
    ) -> Result<ReceivedMessage, DecryptionFailure> {
        let sender = envelope.sender();

        let plaintext = match envelope.algorithm {
            Algorithm::Pairwise => self.receive_pairwise(&sender, envelope).await?,
            Algorithm::Group => self.receive_group(conversation_id, &sender, envelope)?,
        };

        let trust = self.account.devices().trust(&sender);
        Ok(ReceivedMessage {
            plaintext,
            sender,
            trust,
        })
    }

    async fn receive_pairwise(
        &mut self,
        sender: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, DecryptionFailure> {
        let known_identity_key = match self.account.devices().identity_key(sender) {
            Some(identity_key) => Some(*identity_key),
            None => self.directory.identity_key(sender).await.map_err(|err| {
                warn!(%sender, "could not look up identity key: {err}");
                DecryptionFailure::SessionUnavailable
            })?,
        };
        if known_identity_key != Some(envelope.sender_key) {
            warn!(%sender, "sender key does not match known identity key");
            return Err(DecryptionFailure::Undecryptable);
        }

        if envelope.message_index.is_some() {
            warn!(%sender, "pairwise envelope carries a group message index");
            return Err(DecryptionFailure::Undecryptable);
        }

        let message: PairwiseMessage = decode_cbor(&envelope.ciphertext).map_err(|err| {
            warn!(%sender, "invalid pairwise message: {err}");
            DecryptionFailure::Undecryptable
        })?;
        if message.session_id() != envelope.session_id {
            warn!(%sender, "session id of envelope and message differ");
            return Err(DecryptionFailure::Undecryptable);
        }

        let plaintext = self
            .account
            .decrypt_pairwise(
                sender,
                &envelope.sender_key,
                &message,
                &self.config,
                &self.rng,
            )
            .map_err(|err| {
                warn!(%sender, session_id = %envelope.session_id, "decryption failed: {err}");
                DecryptionFailure::from(err.class())
            })?;

        if let Err(err) = self
            .account
            .devices_mut()
            .register(sender, &envelope.sender_key)
        {
            warn!(%sender, "could not register sending device: {err}");
        }

        Ok(plaintext)
    }

    fn receive_group(
        &mut self,
        conversation_id: &ConversationId,
        sender: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, DecryptionFailure> {
        let message: GroupMessage = decode_cbor(&envelope.ciphertext).map_err(|err| {
            warn!(%sender, "invalid group message: {err}");
            DecryptionFailure::Undecryptable
        })?;
        if message.session_id != envelope.session_id
            || Some(message.message_index) != envelope.message_index
        {
            warn!(%sender, "session id or index of envelope and message differ");
            return Err(DecryptionFailure::Undecryptable);
        }

        let Some(y) = self
            .account
            .sessions()
            .inbound_group(&envelope.session_id)
            .cloned()
        else {
            debug!(%sender, session_id = %envelope.session_id, "unknown group session");
            return Err(DecryptionFailure::SessionUnavailable);
        };

        if y.conversation_id() != conversation_id
            || y.sender() != sender
            || y.sender_identity_key() != &envelope.sender_key
        {
            warn!(
                %sender,
                session_id = %envelope.session_id,
                "group session belongs to another conversation or sender"
            );
            return Err(DecryptionFailure::Undecryptable);
        }

        let (y, plaintext) = GroupSession::decrypt(y, &message, &self.config).map_err(|err| {
            warn!(%sender, session_id = %envelope.session_id, "decryption failed: {err}");
            DecryptionFailure::from(err.class())
        })?;
        self.account.sessions_mut().update_inbound_group(y);

        Ok(plaintext)
    }
}

impl<S, M> MessageCodec<PrekeyDirectory<S>, M>
where
    S: PrekeyStore,
    M: ShareMailbox,
{
    /// Publishes our pre-keys to the directory, rotating and refilling them where needed.
    ///
    /// Returns the number of newly published one-time pre-keys.
    pub async fn publish_prekeys(&mut self) -> Result<usize, PublishError<S::Error>> {
        self.account
            .publish_prekeys(&self.directory, &self.config, &self.rng)
            .await
    }
}

fn is_missing_key_material<P, M>(err: &DistributionError<P, M>) -> bool
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    matches!(
        err,
        DistributionError::Directory(
            PrekeyDirectoryError::NoPrekeysAvailable(_)
                | PrekeyDirectoryError::DeviceUnknown(_)
                | PrekeyDirectoryError::ExpiredPrekey(_, _)
        )
    )
}

#[derive(Debug, Error)]
pub enum CodecError<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    #[error(transparent)]
    Distribution(#[from] DistributionError<P, M>),

    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    #[error(transparent)]
    Group(#[from] GroupSessionError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("no recipient of conversation {0} exposes any key material")]
    NoKeyMaterial(ConversationId),

    #[error("no outbound group session for conversation {0}")]
    NoGroupSession(ConversationId),
}

impl<P, M> CodecError<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub fn class(&self) -> ErrorClass {
        match self {
            CodecError::Distribution(err) => err.class(),
            CodecError::Pairwise(err) => err.class(),
            CodecError::Group(err) => err.class(),
            CodecError::Encode(_) => ErrorClass::Fatal,
            CodecError::NoKeyMaterial(_) => ErrorClass::KeyAvailability,
            CodecError::NoGroupSession(_) => ErrorClass::SessionState,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorClass;

    use super::DecryptionFailure;

    #[test]
    fn failures_look_the_same() {
        let unavailable = DecryptionFailure::from(ErrorClass::SessionState);
        let undecryptable = DecryptionFailure::from(ErrorClass::Authentication);
        assert_eq!(unavailable, DecryptionFailure::SessionUnavailable);
        assert_eq!(undecryptable, DecryptionFailure::Undecryptable);
        assert_eq!(unavailable.to_string(), undecryptable.to_string());

        assert_eq!(
            DecryptionFailure::from(ErrorClass::KeyAvailability),
            DecryptionFailure::SessionUnavailable
        );
        assert_eq!(
            DecryptionFailure::from(ErrorClass::ProtocolViolation),
            DecryptionFailure::Undecryptable
        );
    }
}
