// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::hkdf::HkdfError;
use crate::crypto::x25519::{PublicKey, SHARED_SECRET_SIZE, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError, Secret};
use crate::device::{DeviceAddress, DeviceError, DeviceRegistry, VerificationMethod};
use crate::error::ErrorClass;
use crate::time::{Timestamp, now};
use crate::verification::message::{
    CancelReason, Commitment, TransactionId, VerificationMessage,
};
use crate::verification::sas::{Sas, calculate_sas, commitment, confirmation_mac};

/// State of a verification handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Incoming request, waiting for the local user to accept.
    Pending,

    /// Request sent, or accepted and waiting for the initiator's public key.
    Started,

    /// Both ephemeral public keys are known and the shared secret is derived.
    KeyExchanged,

    /// Short authentication string was shown to the user.
    SasReady,

    /// Local user confirmed the strings match, waiting for the peer's confirmation.
    SasMatch,

    Verified,

    Cancelled(CancelReason),

    Expired,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Verified
                | VerificationStatus::Cancelled(_)
                | VerificationStatus::Expired
        )
    }
}

/// Outcome of a handshake step: the new state and the message to send to the peer, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub transaction_id: TransactionId,
    pub peer: DeviceAddress,
    pub status: VerificationStatus,
    pub reply: Option<VerificationMessage>,
}

struct VerificationSession {
    transaction_id: TransactionId,
    peer: DeviceAddress,
    is_initiator: bool,
    status: VerificationStatus,
    secret: Option<SecretKey>,
    public_key: Option<PublicKey>,
    peer_commitment: Option<Commitment>,
    peer_public_key: Option<PublicKey>,
    shared_secret: Option<Secret<SHARED_SECRET_SIZE>>,
    sas: Option<Sas>,
    peer_identity_key: Option<PublicKey>,
    last_activity: Timestamp,
}

impl VerificationSession {
    fn transition(&self, reply: Option<VerificationMessage>) -> Transition {
        Transition {
            transaction_id: self.transaction_id,
            peer: self.peer.clone(),
            status: self.status,
            reply,
        }
    }

    fn cancel(&mut self, reason: CancelReason) -> Transition {
        warn!(
            transaction_id = %self.transaction_id,
            peer = %self.peer,
            ?reason,
            "cancel verification"
        );
        self.status = VerificationStatus::Cancelled(reason);
        self.transition(Some(VerificationMessage::Cancel {
            transaction_id: self.transaction_id,
            reason,
        }))
    }

    /// Ephemeral public keys of initiator and responder, in that order.
    fn public_keys(&self) -> Option<(PublicKey, PublicKey)> {
        let own = self.public_key?;
        let peer = self.peer_public_key?;
        if self.is_initiator {
            Some((own, peer))
        } else {
            Some((peer, own))
        }
    }

    fn derive_shared_secret(&mut self, peer_public_key: PublicKey) -> Result<(), X25519Error> {
        let Some(secret) = &self.secret else {
            return Err(X25519Error::InvalidCurve);
        };
        self.shared_secret = Some(secret.calculate_agreement(&peer_public_key)?);
        self.peer_public_key = Some(peer_public_key);
        self.status = VerificationStatus::KeyExchanged;
        Ok(())
    }
}

/// Interactive SAS verification of remote devices.
///
/// The engine keeps the state of all running handshakes. Every step returns a [`Transition`]
/// with the message to send to the peer. Sessions which reached a terminal state are removed,
/// dropping (and zeroizing) their ephemeral secrets.
///
/// A peer device is only marked verified once the local user confirmed matching strings and a
/// valid confirmation of the peer arrived. Results are written into the [`DeviceRegistry`] handed
/// in by the caller.
pub struct VerificationEngine {
    address: DeviceAddress,
    identity_key: PublicKey,
    sessions: HashMap<TransactionId, VerificationSession>,
    timeout: Duration,
}

impl VerificationEngine {
    /// Creates the engine of our device, identified by its address and public identity key.
    pub fn new(address: DeviceAddress, identity_key: PublicKey, config: &Config) -> Self {
        Self {
            address,
            identity_key,
            sessions: HashMap::new(),
            timeout: config.verification_timeout(),
        }
    }

    /// Starts verifying a peer device.
    ///
    /// Only a commitment to our ephemeral public key is sent, the key itself is revealed after
    /// the peer sent theirs.
    pub fn start(
        &mut self,
        devices: &DeviceRegistry,
        peer: &DeviceAddress,
        rng: &Rng,
    ) -> Result<Transition, VerificationError> {
        if peer == &self.address {
            return Err(VerificationError::OwnDevice);
        }
        if devices.is_retired(peer) {
            return Err(VerificationError::Retired(peer.clone()));
        }

        let transaction_id = TransactionId::random(rng)?;
        let secret = SecretKey::from_bytes(rng.random_array()?);
        let public_key = secret.public_key()?;

        let session = VerificationSession {
            transaction_id,
            peer: peer.clone(),
            is_initiator: true,
            status: VerificationStatus::Started,
            secret: Some(secret),
            public_key: Some(public_key),
            peer_commitment: None,
            peer_public_key: None,
            shared_secret: None,
            sas: None,
            peer_identity_key: None,
            last_activity: now(),
        };

        debug!(%transaction_id, %peer, "start verification");

        let transition = session.transition(Some(VerificationMessage::Start {
            transaction_id,
            from: self.address.clone(),
            to: peer.clone(),
            commitment: commitment(&public_key, &transaction_id),
        }));
        self.sessions.insert(transaction_id, session);
        Ok(transition)
    }

    /// Accepts an incoming request and sends our ephemeral public key.
    pub fn accept(
        &mut self,
        transaction_id: &TransactionId,
        rng: &Rng,
    ) -> Result<Transition, VerificationError> {
        self.step(transaction_id, |session| {
            if session.is_initiator || session.status != VerificationStatus::Pending {
                return Err(VerificationError::InvalidState(
                    session.transaction_id,
                    session.status,
                ));
            }

            let secret = SecretKey::from_bytes(rng.random_array()?);
            let public_key = secret.public_key()?;
            session.secret = Some(secret);
            session.public_key = Some(public_key);
            session.status = VerificationStatus::Started;

            Ok(session.transition(Some(VerificationMessage::Accept {
                transaction_id: session.transaction_id,
                public_key,
            })))
        })
    }

    /// Processes a message from a peer device.
    pub fn handle_message(
        &mut self,
        devices: &mut DeviceRegistry,
        from: &DeviceAddress,
        message: &VerificationMessage,
    ) -> Result<Transition, VerificationError> {
        if let VerificationMessage::Start {
            transaction_id,
            from: initiator,
            to,
            commitment,
        } = message
        {
            return self.handle_start(devices, from, *transaction_id, initiator, to, *commitment);
        }

        let transaction_id = message.transaction_id();
        if self
            .sessions
            .get(&transaction_id)
            .is_some_and(|session| &session.peer != from)
        {
            return Err(VerificationError::UnexpectedSender(
                transaction_id,
                from.clone(),
            ));
        }

        self.step(&transaction_id, |session| match message {
            VerificationMessage::Start { .. } => {
                Ok(session.cancel(CancelReason::UnexpectedMessage))
            }

            VerificationMessage::Cancel { reason, .. } => {
                debug!(
                    %transaction_id,
                    peer = %session.peer,
                    ?reason,
                    "peer cancelled verification"
                );
                session.status = VerificationStatus::Cancelled(*reason);
                Ok(session.transition(None))
            }

            VerificationMessage::Accept { public_key, .. } => {
                if !session.is_initiator || session.status != VerificationStatus::Started {
                    return Ok(session.cancel(CancelReason::UnexpectedMessage));
                }
                if session.derive_shared_secret(*public_key).is_err() {
                    return Ok(session.cancel(CancelReason::KeyMismatch));
                }
                let Some(own_public_key) = session.public_key else {
                    return Ok(session.cancel(CancelReason::UnexpectedMessage));
                };

                // Peer is bound to its key now, we can reveal ours.
                Ok(session.transition(Some(VerificationMessage::KeyExchange {
                    transaction_id,
                    public_key: own_public_key,
                })))
            }

            VerificationMessage::KeyExchange { public_key, .. } => {
                if session.is_initiator
                    || session.status != VerificationStatus::Started
                    || session.public_key.is_none()
                {
                    return Ok(session.cancel(CancelReason::UnexpectedMessage));
                }

                let expected = commitment(public_key, &transaction_id);
                let matches = session
                    .peer_commitment
                    .is_some_and(|committed| bool::from(committed[..].ct_eq(&expected[..])));
                if !matches {
                    return Ok(session.cancel(CancelReason::CommitmentMismatch));
                }

                if session.derive_shared_secret(*public_key).is_err() {
                    return Ok(session.cancel(CancelReason::KeyMismatch));
                }
                Ok(session.transition(None))
            }

            VerificationMessage::Confirm {
                identity_key, mac, ..
            } => {
                let expecting_confirmation = matches!(
                    session.status,
                    VerificationStatus::KeyExchanged
                        | VerificationStatus::SasReady
                        | VerificationStatus::SasMatch
                ) && session.peer_identity_key.is_none();
                let (Some(shared_secret), Some(peer_public_key), true) = (
                    session.shared_secret.clone(),
                    session.peer_public_key,
                    expecting_confirmation,
                ) else {
                    return Ok(session.cancel(CancelReason::UnexpectedMessage));
                };

                if devices
                    .identity_key(&session.peer)
                    .is_some_and(|known| known != identity_key)
                {
                    return Ok(session.cancel(CancelReason::KeyMismatch));
                }

                let expected = confirmation_mac(
                    &shared_secret,
                    &peer_public_key,
                    &transaction_id,
                    identity_key,
                )?;
                if !bool::from(expected[..].ct_eq(&mac[..])) {
                    return Ok(session.cancel(CancelReason::KeyMismatch));
                }

                session.peer_identity_key = Some(*identity_key);
                if session.status == VerificationStatus::SasMatch {
                    Self::complete(devices, session)?;
                }
                Ok(session.transition(None))
            }
        })
    }

    fn handle_start(
        &mut self,
        devices: &DeviceRegistry,
        from: &DeviceAddress,
        transaction_id: TransactionId,
        initiator: &DeviceAddress,
        to: &DeviceAddress,
        commitment: Commitment,
    ) -> Result<Transition, VerificationError> {
        if to != &self.address {
            return Err(VerificationError::WrongRecipient(transaction_id));
        }
        if initiator != from {
            return Err(VerificationError::UnexpectedSender(
                transaction_id,
                from.clone(),
            ));
        }
        if self.sessions.contains_key(&transaction_id) {
            return Err(VerificationError::DuplicateTransaction(transaction_id));
        }
        if devices.is_retired(from) {
            return Err(VerificationError::Retired(from.clone()));
        }

        let session = VerificationSession {
            transaction_id,
            peer: from.clone(),
            is_initiator: false,
            status: VerificationStatus::Pending,
            secret: None,
            public_key: None,
            peer_commitment: Some(commitment),
            peer_public_key: None,
            shared_secret: None,
            sas: None,
            peer_identity_key: None,
            last_activity: now(),
        };

        debug!(%transaction_id, peer = %from, "incoming verification request");

        let transition = session.transition(None);
        self.sessions.insert(transaction_id, session);
        Ok(transition)
    }

    /// Derives the short authentication string to show to the user.
    pub fn calculate_sas(
        &mut self,
        transaction_id: &TransactionId,
    ) -> Result<Sas, VerificationError> {
        let mut sas = None;
        self.step(transaction_id, |session| {
            let value = match (&session.sas, &session.shared_secret, session.public_keys()) {
                (Some(value), _, _) => value.clone(),
                (None, Some(shared_secret), Some((initiator_key, responder_key))) => {
                    calculate_sas(shared_secret, &initiator_key, &responder_key, transaction_id)?
                }
                _ => {
                    return Err(VerificationError::InvalidState(
                        session.transaction_id,
                        session.status,
                    ));
                }
            };

            if session.status == VerificationStatus::KeyExchanged {
                session.status = VerificationStatus::SasReady;
            }
            session.sas = Some(value.clone());
            sas = Some(value);
            Ok(session.transition(None))
        })?;

        sas.ok_or(VerificationError::UnknownTransaction(*transaction_id))
    }

    /// Reports whether the user saw matching strings on both devices.
    ///
    /// A mismatch cancels the verification. A match sends our confirmation, and completes the
    /// verification when the peer's confirmation was received already.
    pub fn confirm(
        &mut self,
        devices: &mut DeviceRegistry,
        transaction_id: &TransactionId,
        is_match: bool,
    ) -> Result<Transition, VerificationError> {
        let identity_key = self.identity_key;
        self.step(transaction_id, |session| {
            if session.status != VerificationStatus::SasReady {
                return Err(VerificationError::InvalidState(
                    session.transaction_id,
                    session.status,
                ));
            }

            if !is_match {
                return Ok(session.cancel(CancelReason::SasMismatch));
            }

            let (Some(shared_secret), Some(public_key)) =
                (&session.shared_secret, session.public_key)
            else {
                return Err(VerificationError::InvalidState(
                    session.transaction_id,
                    session.status,
                ));
            };
            let mac = confirmation_mac(shared_secret, &public_key, transaction_id, &identity_key)?;
            let reply = VerificationMessage::Confirm {
                transaction_id: *transaction_id,
                identity_key,
                mac,
            };

            session.status = VerificationStatus::SasMatch;
            if session.peer_identity_key.is_some() {
                Self::complete(devices, session)?;
            }
            Ok(session.transition(Some(reply)))
        })
    }

    /// Cancels a running verification.
    pub fn cancel(
        &mut self,
        transaction_id: &TransactionId,
        reason: CancelReason,
    ) -> Result<Transition, VerificationError> {
        self.step(transaction_id, |session| Ok(session.cancel(reason)))
    }

    /// Removes all verifications which were idle for longer than the configured timeout.
    pub fn expire_stale(&mut self, now: Timestamp) -> Vec<Transition> {
        let timeout = self.timeout.as_secs();
        let stale: Vec<TransactionId> = self
            .sessions
            .values()
            .filter(|session| now >= session.last_activity.saturating_add(timeout))
            .map(|session| session.transaction_id)
            .collect();

        stale
            .into_iter()
            .filter_map(|transaction_id| self.sessions.remove(&transaction_id))
            .map(|mut session| {
                debug!(transaction_id = %session.transaction_id, "verification expired");
                session.status = VerificationStatus::Expired;
                session.transition(None)
            })
            .collect()
    }

    pub fn status(&self, transaction_id: &TransactionId) -> Option<VerificationStatus> {
        self.sessions.get(transaction_id).map(|session| session.status)
    }

    pub fn peer(&self, transaction_id: &TransactionId) -> Option<&DeviceAddress> {
        self.sessions.get(transaction_id).map(|session| &session.peer)
    }

    /// Runs one step on a session. Sessions ending in a terminal state are dropped.
    fn step<F>(
        &mut self,
        transaction_id: &TransactionId,
        f: F,
    ) -> Result<Transition, VerificationError>
    where
        F: FnOnce(&mut VerificationSession) -> Result<Transition, VerificationError>,
    {
        let mut session = self
            .sessions
            .remove(transaction_id)
            .ok_or(VerificationError::UnknownTransaction(*transaction_id))?;

        if now() >= session.last_activity.saturating_add(self.timeout.as_secs()) {
            debug!(%transaction_id, "verification expired");
            return Err(VerificationError::Expired(*transaction_id));
        }

        let result = f(&mut session);
        match &result {
            Ok(transition) if transition.status.is_terminal() => (),
            _ => {
                session.last_activity = now();
                self.sessions.insert(*transaction_id, session);
            }
        }
        result
    }

    fn complete(
        devices: &mut DeviceRegistry,
        session: &mut VerificationSession,
    ) -> Result<(), VerificationError> {
        let Some(identity_key) = session.peer_identity_key else {
            return Ok(());
        };
        devices.register(&session.peer, &identity_key)?;
        devices.mark_verified(&session.peer, VerificationMethod::Sas)?;
        session.status = VerificationStatus::Verified;
        debug!(transaction_id = %session.transaction_id, peer = %session.peer, "device verified");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("unknown verification {0}")]
    UnknownTransaction(TransactionId),

    #[error("verification {0} exists already")]
    DuplicateTransaction(TransactionId),

    #[error("message for verification {0} from unexpected device {1}")]
    UnexpectedSender(TransactionId, DeviceAddress),

    #[error("verification request {0} is addressed to another device")]
    WrongRecipient(TransactionId),

    #[error("verification {0} is in state {1:?}")]
    InvalidState(TransactionId, VerificationStatus),

    #[error("verification {0} expired")]
    Expired(TransactionId),

    #[error("device {0} was retired")]
    Retired(DeviceAddress),

    #[error("can't verify our own device")]
    OwnDevice,
}

impl VerificationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VerificationError::Rng(_) | VerificationError::Hkdf(_) => ErrorClass::Fatal,
            VerificationError::UnknownTransaction(_) | VerificationError::Expired(_) => {
                ErrorClass::SessionState
            }
            VerificationError::Retired(_) => ErrorClass::KeyAvailability,
            VerificationError::X25519(_)
            | VerificationError::Device(_)
            | VerificationError::DuplicateTransaction(_)
            | VerificationError::UnexpectedSender(_, _)
            | VerificationError::WrongRecipient(_)
            | VerificationError::InvalidState(_, _)
            | VerificationError::OwnDevice => ErrorClass::ProtocolViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::account::Account;
    use crate::config::Config;
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::device::{DeviceAddress, Trust, VerificationMethod};
    use crate::time::now;
    use crate::verification::message::{CancelReason, VerificationMessage};

    use super::{VerificationEngine, VerificationError, VerificationStatus};

    struct Member {
        account: Account,
        engine: VerificationEngine,
    }

    fn member(user_id: &str, config: &Config, rng: &Rng) -> Member {
        let account = Account::new(DeviceAddress::new(user_id, "device"), config, rng).unwrap();
        let engine =
            VerificationEngine::new(account.address().clone(), account.identity_key(), config);
        Member { account, engine }
    }

    #[test]
    fn verify_devices() {
        let rng = Rng::from_seed([1; 32]);
        let config = Config::default();
        let mut alice = member("alice", &config, &rng);
        let mut bob = member("bob", &config, &rng);
        let alice_address = alice.account.address().clone();
        let bob_address = bob.account.address().clone();

        let start = alice.engine.start(alice.account.devices(), &bob_address, &rng).unwrap();
        assert_eq!(start.status, VerificationStatus::Started);
        let transaction_id = start.transaction_id;

        let request = bob
            .engine
            .handle_message(bob.account.devices_mut(), &alice_address, &start.reply.unwrap())
            .unwrap();
        assert_eq!(request.status, VerificationStatus::Pending);
        assert!(request.reply.is_none());

        let accept = bob.engine.accept(&transaction_id, &rng).unwrap();
        let key_exchange = alice
            .engine
            .handle_message(alice.account.devices_mut(), &bob_address, &accept.reply.unwrap())
            .unwrap();
        assert_eq!(key_exchange.status, VerificationStatus::KeyExchanged);

        let exchanged = bob
            .engine
            .handle_message(bob.account.devices_mut(), &alice_address, &key_exchange.reply.unwrap())
            .unwrap();
        assert_eq!(exchanged.status, VerificationStatus::KeyExchanged);

        let alice_sas = alice.engine.calculate_sas(&transaction_id).unwrap();
        let bob_sas = bob.engine.calculate_sas(&transaction_id).unwrap();
        assert_eq!(alice_sas, bob_sas);
        assert_eq!(
            alice.engine.status(&transaction_id),
            Some(VerificationStatus::SasReady)
        );

        // Alice confirms first, she needs to wait for Bob.
        let alice_confirm = alice
            .engine
            .confirm(alice.account.devices_mut(), &transaction_id, true)
            .unwrap();
        assert_eq!(alice_confirm.status, VerificationStatus::SasMatch);
        assert_eq!(alice.account.devices().trust(&bob_address), Trust::Unknown);

        let received = bob
            .engine
            .handle_message(
                bob.account.devices_mut(),
                &alice_address,
                &alice_confirm.reply.unwrap(),
            )
            .unwrap();
        assert_eq!(received.status, VerificationStatus::SasReady);
        assert_eq!(bob.account.devices().trust(&alice_address), Trust::Unknown);

        let bob_confirm = bob
            .engine
            .confirm(bob.account.devices_mut(), &transaction_id, true)
            .unwrap();
        assert_eq!(bob_confirm.status, VerificationStatus::Verified);
        assert_eq!(
            bob.account.devices().trust(&alice_address),
            Trust::Verified(VerificationMethod::Sas)
        );
        assert!(bob.engine.status(&transaction_id).is_none());

        let done = alice
            .engine
            .handle_message(alice.account.devices_mut(), &bob_address, &bob_confirm.reply.unwrap())
            .unwrap();
        assert_eq!(done.status, VerificationStatus::Verified);
        assert_eq!(
            alice.account.devices().trust(&bob_address),
            Trust::Verified(VerificationMethod::Sas)
        );
        assert_eq!(
            alice.account.devices().identity_key(&bob_address),
            Some(&bob.account.identity_key())
        );
    }

    #[test]
    fn revealed_key_must_match_commitment() {
        let rng = Rng::from_seed([2; 32]);
        let config = Config::default();
        let mut alice = member("alice", &config, &rng);
        let mut bob = member("bob", &config, &rng);
        let alice_address = alice.account.address().clone();
        let bob_address = bob.account.address().clone();

        let start = alice.engine.start(alice.account.devices(), &bob_address, &rng).unwrap();
        let transaction_id = start.transaction_id;
        bob.engine
            .handle_message(bob.account.devices_mut(), &alice_address, &start.reply.unwrap())
            .unwrap();
        bob.engine.accept(&transaction_id, &rng).unwrap();

        // Someone in the middle replaces the initiator's key after seeing Bob's.
        let forged_key = SecretKey::from_bytes(rng.random_array().unwrap())
            .public_key()
            .unwrap();
        let forged = VerificationMessage::KeyExchange {
            transaction_id,
            public_key: forged_key,
        };

        let cancelled = bob
            .engine
            .handle_message(bob.account.devices_mut(), &alice_address, &forged)
            .unwrap();
        assert_eq!(
            cancelled.status,
            VerificationStatus::Cancelled(CancelReason::CommitmentMismatch)
        );
        assert_matches!(
            cancelled.reply,
            Some(VerificationMessage::Cancel {
                reason: CancelReason::CommitmentMismatch,
                ..
            })
        );
        assert!(bob.engine.status(&transaction_id).is_none());
        assert_eq!(bob.account.devices().trust(&alice_address), Trust::Unknown);

        // Alice learns about the cancellation.
        let alice_cancelled = alice
            .engine
            .handle_message(alice.account.devices_mut(), &bob_address, &cancelled.reply.unwrap())
            .unwrap();
        assert_eq!(
            alice_cancelled.status,
            VerificationStatus::Cancelled(CancelReason::CommitmentMismatch)
        );
        assert!(alice.engine.status(&transaction_id).is_none());
    }

    #[test]
    fn mismatching_sas_cancels() {
        let rng = Rng::from_seed([3; 32]);
        let config = Config::default();
        let mut alice = member("alice", &config, &rng);
        let mut bob = member("bob", &config, &rng);
        let alice_address = alice.account.address().clone();
        let bob_address = bob.account.address().clone();

        let start = alice.engine.start(alice.account.devices(), &bob_address, &rng).unwrap();
        let transaction_id = start.transaction_id;
        bob.engine
            .handle_message(bob.account.devices_mut(), &alice_address, &start.reply.unwrap())
            .unwrap();
        let accept = bob.engine.accept(&transaction_id, &rng).unwrap();
        alice
            .engine
            .handle_message(alice.account.devices_mut(), &bob_address, &accept.reply.unwrap())
            .unwrap();

        // Confirming before the string was shown is not allowed.
        assert_matches!(
            alice.engine.confirm(alice.account.devices_mut(), &transaction_id, true),
            Err(VerificationError::InvalidState(_, VerificationStatus::KeyExchanged))
        );

        alice.engine.calculate_sas(&transaction_id).unwrap();
        let cancelled = alice
            .engine
            .confirm(alice.account.devices_mut(), &transaction_id, false)
            .unwrap();
        assert_eq!(
            cancelled.status,
            VerificationStatus::Cancelled(CancelReason::SasMismatch)
        );
        assert!(alice.engine.status(&transaction_id).is_none());
        assert_eq!(alice.account.devices().trust(&bob_address), Trust::Unknown);
    }

    #[test]
    fn unexpected_messages() {
        let rng = Rng::from_seed([4; 32]);
        let config = Config::default();
        let mut alice = member("alice", &config, &rng);
        let bob = member("bob", &config, &rng);
        let mut mallory = member("mallory", &config, &rng);
        let bob_address = bob.account.address().clone();
        let mallory_address = mallory.account.address().clone();

        let start = alice.engine.start(alice.account.devices(), &bob_address, &rng).unwrap();
        let transaction_id = start.transaction_id;

        // Request addressed to somebody else.
        assert_matches!(
            mallory.engine.handle_message(
                mallory.account.devices_mut(),
                alice.account.address(),
                start.reply.as_ref().unwrap()
            ),
            Err(VerificationError::WrongRecipient(_))
        );

        // Third device can't interfere with a running verification.
        let public_key = SecretKey::from_bytes(rng.random_array().unwrap())
            .public_key()
            .unwrap();
        let accept = VerificationMessage::Accept {
            transaction_id,
            public_key,
        };
        assert_matches!(
            alice
                .engine
                .handle_message(alice.account.devices_mut(), &mallory_address, &accept),
            Err(VerificationError::UnexpectedSender(_, _))
        );
        assert_eq!(
            alice.engine.status(&transaction_id),
            Some(VerificationStatus::Started)
        );

        // Initiator never receives the initiator's key reveal.
        let key_exchange = VerificationMessage::KeyExchange {
            transaction_id,
            public_key,
        };
        let cancelled = alice
            .engine
            .handle_message(alice.account.devices_mut(), &bob_address, &key_exchange)
            .unwrap();
        assert_eq!(
            cancelled.status,
            VerificationStatus::Cancelled(CancelReason::UnexpectedMessage)
        );
        assert!(alice.engine.status(&transaction_id).is_none());
    }

    #[test]
    fn cancel_and_expire() {
        let rng = Rng::from_seed([5; 32]);
        let config = Config::default();
        let alice = member("alice", &config, &rng);
        let mut engine = alice.engine;
        let bob_address = DeviceAddress::new("bob", "device");
        let carol_address = DeviceAddress::new("carol", "device");

        let to_bob = engine.start(alice.account.devices(), &bob_address, &rng).unwrap();
        let to_carol = engine.start(alice.account.devices(), &carol_address, &rng).unwrap();

        let cancelled = engine
            .cancel(&to_bob.transaction_id, CancelReason::User)
            .unwrap();
        assert_eq!(
            cancelled.status,
            VerificationStatus::Cancelled(CancelReason::User)
        );
        assert!(engine.status(&to_bob.transaction_id).is_none());
        assert_matches!(
            engine.cancel(&to_bob.transaction_id, CancelReason::User),
            Err(VerificationError::UnknownTransaction(_))
        );

        // Nothing is stale yet.
        assert!(engine.expire_stale(now()).is_empty());

        let timeout = config.verification_timeout().as_secs();
        let expired = engine.expire_stale(now() + timeout + 1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].transaction_id, to_carol.transaction_id);
        assert_eq!(expired[0].status, VerificationStatus::Expired);
        assert!(engine.status(&to_carol.transaction_id).is_none());
    }

    #[test]
    fn own_device_is_rejected() {
        let rng = Rng::from_seed([6; 32]);
        let config = Config::default();
        let mut alice = member("alice", &config, &rng);
        let own_address = alice.account.address().clone();
        assert_matches!(
            alice.engine.start(alice.account.devices(), &own_address, &rng),
            Err(VerificationError::OwnDevice)
        );
    }
}
