// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fan-out of group session keys to all recipient devices of a conversation.
//!
//! Every recipient device receives its own [`SessionShare`], encrypted with the pairwise session
//! between the sending and the receiving device. Pairwise sessions are established on demand by
//! claiming a pre-key bundle of the recipient.
//!
//! Distribution fails or succeeds per device: one unreachable device never blocks delivery to
//! the others. Retrying is up to the caller.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::account::Account;
use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::config::Config;
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError};
use crate::device::{DeviceAddress, DeviceError};
use crate::error::ErrorClass;
use crate::group::{GroupSession, GroupSessionKey, OutboundGroupSessionState};
use crate::pairwise::{PairwiseError, PairwiseMessage, PairwiseSession};
use crate::prekey_directory::PrekeyDirectoryError;
use crate::traits::{PrekeyProvider, ShareMailbox};
use crate::types::{ConversationId, MessageIndex, SessionId, ShareId};

/// Encrypted group session key addressed to one recipient device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionShare {
    share_id: ShareId,
    conversation_id: ConversationId,
    session_id: SessionId,
    sender: DeviceAddress,
    sender_identity_key: PublicKey,
    recipient: DeviceAddress,
    encrypted_session_key: PairwiseMessage,
    first_known_index: MessageIndex,
}

impl SessionShare {
    pub fn share_id(&self) -> &ShareId {
        &self.share_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn sender(&self) -> &DeviceAddress {
        &self.sender
    }

    pub fn sender_identity_key(&self) -> &PublicKey {
        &self.sender_identity_key
    }

    pub fn recipient(&self) -> &DeviceAddress {
        &self.recipient
    }

    pub fn first_known_index(&self) -> MessageIndex {
        self.first_known_index
    }
}

/// Result of distributing a session to one device.
#[derive(Debug)]
pub struct DistributionOutcome<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub device: DeviceAddress,
    pub result: Result<ShareId, DistributionError<P, M>>,
}

impl<P, M> DistributionOutcome<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Shares which were skipped while claiming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedShare {
    pub share_id: ShareId,
    pub sender: DeviceAddress,
    pub class: ErrorClass,
}

/// Summary of claiming pending session shares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimReport {
    /// Group sessions which were imported.
    pub imported: Vec<SessionId>,

    /// Shares which failed and were left in the mailbox.
    pub skipped: Vec<SkippedShare>,
}

/// Distributes group session keys over pairwise sessions.
pub struct SessionKeyDistributor<'a, P, M> {
    directory: &'a P,
    mailbox: &'a M,
    config: &'a Config,
    rng: &'a Rng,
}

impl<'a, P, M> SessionKeyDistributor<'a, P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub fn new(directory: &'a P, mailbox: &'a M, config: &'a Config, rng: &'a Rng) -> Self {
        Self {
            directory,
            mailbox,
            config,
            rng,
        }
    }

    /// Returns the current pairwise session with a device, establishing one if needed.
    ///
    /// New sessions claim a one-time pre-key of the device. When it ran out of them and the
    /// configuration allows it, the session falls back to the signed pre-key only. Retired
    /// devices are never resolved, even when a session with them exists.
    pub async fn resolve_pairwise(
        &self,
        account: &mut Account,
        peer: &DeviceAddress,
    ) -> Result<SessionId, DistributionError<P, M>> {
        if account.devices().is_retired(peer) {
            return Err(DistributionError::Retired(peer.clone()));
        }

        if let Some(y) = account.sessions().current_pairwise(peer) {
            return Ok(y.session_id());
        }

        let bundle = match self.directory.claim(peer).await {
            Ok(bundle) => bundle,
            Err(PrekeyDirectoryError::NoPrekeysAvailable(_))
                if self.config.signed_prekey_fallback =>
            {
                warn!(%peer, "no one-time pre-keys left, falling back to signed pre-key");
                self.directory.signed_prekey_bundle(peer).await?
            }
            Err(err) => return Err(err.into()),
        };

        // The first identity key we see for a device is the one it will always have.
        account.devices_mut().register(peer, bundle.identity_key())?;

        let y = PairwiseSession::initiate(account.keys(), &bundle, self.rng)?;
        let session_id = y.session_id();
        account.sessions_mut().insert_pairwise(peer.clone(), y);

        Ok(session_id)
    }

    /// Sends the current state of a group session to every given device.
    ///
    /// Returns one outcome per device. Our own device is skipped.
    pub async fn distribute(
        &self,
        account: &mut Account,
        group_session: &OutboundGroupSessionState,
        recipients: &[DeviceAddress],
    ) -> Vec<DistributionOutcome<P, M>> {
        let mut outcomes = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if recipient == account.address() {
                continue;
            }

            let result = self.share_to(account, group_session, recipient).await;
            if let Err(err) = &result {
                warn!(
                    session_id = %group_session.session_id(),
                    %recipient,
                    "failed to distribute group session: {err}"
                );
            }

            outcomes.push(DistributionOutcome {
                device: recipient.clone(),
                result,
            });
        }
        outcomes
    }

    async fn share_to(
        &self,
        account: &mut Account,
        group_session: &OutboundGroupSessionState,
        recipient: &DeviceAddress,
    ) -> Result<ShareId, DistributionError<P, M>> {
        let pairwise_id = self.resolve_pairwise(account, recipient).await?;

        let session_key = GroupSession::export_key(group_session);
        let encrypted_session_key =
            account.encrypt_pairwise(&pairwise_id, &encode_cbor(&session_key)?)?;

        let share = SessionShare {
            share_id: ShareId::random(self.rng)?,
            conversation_id: group_session.conversation_id().clone(),
            session_id: group_session.session_id(),
            sender: account.address().clone(),
            sender_identity_key: account.identity_key(),
            recipient: recipient.clone(),
            encrypted_session_key,
            first_known_index: session_key.message_index(),
        };
        let share_id = share.share_id;

        self.mailbox
            .send_share(share)
            .await
            .map_err(DistributionError::Mailbox)?;

        debug!(
            session_id = %group_session.session_id(),
            %recipient,
            %share_id,
            "sent session share"
        );

        Ok(share_id)
    }

    /// Fetches all session shares addressed to our device and imports them.
    ///
    /// Shares which fail are logged and skipped, they do not affect the rest of the batch.
    /// Imported shares are marked as claimed in the mailbox.
    pub async fn claim_pending(
        &self,
        account: &mut Account,
    ) -> Result<ClaimReport, DistributionError<P, M>> {
        let shares = self
            .mailbox
            .fetch_pending(account.address())
            .await
            .map_err(DistributionError::Mailbox)?;

        let mut report = ClaimReport::default();
        for share in shares {
            match self.import_share(account, &share).await {
                Ok(session_id) => {
                    self.mailbox
                        .mark_claimed(account.address(), &share.share_id)
                        .await
                        .map_err(DistributionError::Mailbox)?;
                    report.imported.push(session_id);
                }
                Err(err) => {
                    warn!(
                        share_id = %share.share_id,
                        sender = %share.sender,
                        "skipped session share: {err}"
                    );
                    report.skipped.push(SkippedShare {
                        share_id: share.share_id,
                        sender: share.sender.clone(),
                        class: err.class(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn import_share(
        &self,
        account: &mut Account,
        share: &SessionShare,
    ) -> Result<SessionId, ClaimError<P>> {
        if share.recipient != *account.address() {
            return Err(ClaimError::WrongRecipient(share.share_id));
        }

        // The claimed sender identity needs to match what we (or the directory) know about the
        // sending device.
        let known_identity_key = match account.devices().identity_key(&share.sender) {
            Some(identity_key) => Some(*identity_key),
            None => self.directory.identity_key(&share.sender).await?,
        };
        match known_identity_key {
            Some(identity_key) if identity_key == share.sender_identity_key => (),
            Some(_) => return Err(ClaimError::SenderMismatch(share.sender.clone())),
            None => return Err(ClaimError::SenderUnknown(share.sender.clone())),
        }

        // Group sessions are owned by one sender, nobody else can hand out keys for them.
        if account
            .sessions()
            .inbound_group(&share.session_id)
            .is_some_and(|existing| existing.sender() != &share.sender)
        {
            return Err(ClaimError::InvalidShare(share.share_id));
        }

        let plaintext = account.decrypt_pairwise(
            &share.sender,
            &share.sender_identity_key,
            &share.encrypted_session_key,
            self.config,
            self.rng,
        )?;
        let session_key: GroupSessionKey = decode_cbor(&plaintext)?;

        if session_key.session_id() != share.session_id
            || session_key.conversation_id() != &share.conversation_id
            || session_key.message_index() != share.first_known_index
        {
            return Err(ClaimError::InvalidShare(share.share_id));
        }

        account
            .devices_mut()
            .register(&share.sender, &share.sender_identity_key)?;

        let inbound = GroupSession::import_from_share(
            session_key,
            share.sender.clone(),
            share.sender_identity_key,
        );
        account.sessions_mut().insert_inbound_group(inbound);

        Ok(share.session_id)
    }
}

#[derive(Debug, Error)]
pub enum DistributionError<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    #[error(transparent)]
    Directory(#[from] PrekeyDirectoryError<P::Error>),

    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("{0}")]
    Mailbox(M::Error),

    #[error("device {0} was retired and does not receive session keys")]
    Retired(DeviceAddress),
}

impl<P, M> DistributionError<P, M>
where
    P: PrekeyProvider,
    M: ShareMailbox,
{
    pub fn class(&self) -> ErrorClass {
        match self {
            DistributionError::Directory(err) => err.class(),
            DistributionError::Pairwise(err) => err.class(),
            DistributionError::Device(_) => ErrorClass::ProtocolViolation,
            DistributionError::Encode(_) | DistributionError::Rng(_) => ErrorClass::Fatal,
            DistributionError::Mailbox(_) | DistributionError::Retired(_) => {
                ErrorClass::KeyAvailability
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimError<P>
where
    P: PrekeyProvider,
{
    #[error(transparent)]
    Directory(#[from] PrekeyDirectoryError<P::Error>),

    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("session share {0} is addressed to another device")]
    WrongRecipient(ShareId),

    #[error("identity key of sender {0} does not match the known one")]
    SenderMismatch(DeviceAddress),

    #[error("identity key of sender {0} can not be verified")]
    SenderUnknown(DeviceAddress),

    #[error("session share {0} does not match the encrypted session key")]
    InvalidShare(ShareId),
}

impl<P> ClaimError<P>
where
    P: PrekeyProvider,
{
    pub fn class(&self) -> ErrorClass {
        match self {
            ClaimError::Directory(err) => err.class(),
            ClaimError::Pairwise(err) => err.class(),
            ClaimError::Decode(_)
            | ClaimError::Device(_)
            | ClaimError::WrongRecipient(_)
            | ClaimError::SenderMismatch(_)
            | ClaimError::InvalidShare(_) => ErrorClass::ProtocolViolation,
            ClaimError::SenderUnknown(_) => ErrorClass::KeyAvailability,
        }
    }
}
