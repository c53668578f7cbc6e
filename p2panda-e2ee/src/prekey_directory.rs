// SPDX-License-Identifier: MIT OR Apache-2.0

//! Directory of published pre-keys.
//!
//! Devices publish their identity key, a signed pre-key and a batch of one-time pre-keys.
//! Other devices claim a [`PrekeyBundle`] from the directory to start a pairwise session even
//! when the owner of the pre-keys is offline. Every one-time pre-key is handed out at most once,
//! the first claimer wins.
use std::fmt::{Debug, Display};

use thiserror::Error;
use tracing::debug;

use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::XSignature;
use crate::device::DeviceAddress;
use crate::error::ErrorClass;
use crate::key_bundle::{OneTimePreKey, PreKeyId, PrekeyBundle, SignedPreKey};
use crate::traits::{PrekeyProvider, PrekeyStore};

/// Pre-key directory on top of a storage backend.
#[derive(Clone, Debug)]
pub struct PrekeyDirectory<S> {
    store: S,
}

impl<S> PrekeyDirectory<S>
where
    S: PrekeyStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Publishes the signed pre-key and one-time pre-keys of a device.
    ///
    /// Publishing is idempotent per key id: pre-keys which were published before are ignored and
    /// a signed pre-key only replaces the current one when it has a higher id. Returns the number
    /// of newly added one-time pre-keys.
    pub async fn publish(
        &self,
        device: &DeviceAddress,
        identity_key: &PublicKey,
        signed_prekey: &SignedPreKey,
        signature: &XSignature,
        onetime_prekeys: &[OneTimePreKey],
    ) -> Result<usize, PrekeyDirectoryError<S::Error>> {
        signed_prekey
            .verify_signature(identity_key, signature)
            .map_err(|_| PrekeyDirectoryError::InvalidSignature(device.clone()))?;

        if signed_prekey.verify_lifetime().is_err() {
            return Err(PrekeyDirectoryError::ExpiredPrekey(
                device.clone(),
                signed_prekey.id(),
            ));
        }

        match self
            .store
            .identity_key(device)
            .await
            .map_err(PrekeyDirectoryError::Store)?
        {
            Some(known_key) if known_key != *identity_key => {
                return Err(PrekeyDirectoryError::IdentityMismatch(device.clone()));
            }
            Some(_) => (),
            None => {
                self.store
                    .set_identity_key(device, identity_key)
                    .await
                    .map_err(PrekeyDirectoryError::Store)?;
            }
        }

        let current = self
            .store
            .signed_prekey(device)
            .await
            .map_err(PrekeyDirectoryError::Store)?;
        let is_newer = current
            .map(|(prekey, _)| prekey.id() < signed_prekey.id())
            .unwrap_or(true);
        if is_newer {
            self.store
                .set_signed_prekey(device, signed_prekey, signature)
                .await
                .map_err(PrekeyDirectoryError::Store)?;
        }

        let added = self
            .store
            .add_onetime_prekeys(device, onetime_prekeys)
            .await
            .map_err(PrekeyDirectoryError::Store)?;

        debug!(
            %device,
            prekey_id = signed_prekey.id(),
            onetime_prekeys = added,
            "published pre-keys"
        );

        Ok(added)
    }

    /// Claims one unconsumed one-time pre-key of a device together with its current signed
    /// pre-key.
    ///
    /// Fails with [`PrekeyDirectoryError::NoPrekeysAvailable`] when the device ran out of
    /// one-time pre-keys. Callers can fall back to [`PrekeyDirectory::signed_prekey_bundle`] in
    /// this case, accepting reduced forward secrecy for the first messages.
    pub async fn claim(
        &self,
        device: &DeviceAddress,
    ) -> Result<PrekeyBundle, PrekeyDirectoryError<S::Error>> {
        let (identity_key, signed_prekey, signature) = self.current_prekey(device).await?;

        let Some(onetime_prekey) = self
            .store
            .claim_onetime_prekey(device)
            .await
            .map_err(PrekeyDirectoryError::Store)?
        else {
            return Err(PrekeyDirectoryError::NoPrekeysAvailable(device.clone()));
        };

        debug!(%device, onetime_prekey_id = onetime_prekey.id(), "claimed one-time pre-key");

        Ok(PrekeyBundle::new(
            identity_key,
            signed_prekey,
            signature,
            Some(onetime_prekey),
        ))
    }

    /// Returns the current signed pre-key of a device without claiming a one-time pre-key.
    pub async fn signed_prekey_bundle(
        &self,
        device: &DeviceAddress,
    ) -> Result<PrekeyBundle, PrekeyDirectoryError<S::Error>> {
        let (identity_key, signed_prekey, signature) = self.current_prekey(device).await?;
        Ok(PrekeyBundle::new(
            identity_key,
            signed_prekey,
            signature,
            None,
        ))
    }

    pub async fn identity_key(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<PublicKey>, PrekeyDirectoryError<S::Error>> {
        self.store
            .identity_key(device)
            .await
            .map_err(PrekeyDirectoryError::Store)
    }

    /// Number of unclaimed one-time pre-keys, so owners know when to replenish them.
    pub async fn onetime_prekey_count(
        &self,
        device: &DeviceAddress,
    ) -> Result<usize, PrekeyDirectoryError<S::Error>> {
        self.store
            .onetime_prekey_count(device)
            .await
            .map_err(PrekeyDirectoryError::Store)
    }

    async fn current_prekey(
        &self,
        device: &DeviceAddress,
    ) -> Result<(PublicKey, SignedPreKey, XSignature), PrekeyDirectoryError<S::Error>> {
        let identity_key = self
            .store
            .identity_key(device)
            .await
            .map_err(PrekeyDirectoryError::Store)?
            .ok_or_else(|| PrekeyDirectoryError::DeviceUnknown(device.clone()))?;

        let (signed_prekey, signature) = self
            .store
            .signed_prekey(device)
            .await
            .map_err(PrekeyDirectoryError::Store)?
            .ok_or_else(|| PrekeyDirectoryError::DeviceUnknown(device.clone()))?;

        if signed_prekey.verify_lifetime().is_err() {
            return Err(PrekeyDirectoryError::ExpiredPrekey(
                device.clone(),
                signed_prekey.id(),
            ));
        }

        Ok((identity_key, signed_prekey, signature))
    }
}

impl<S> PrekeyProvider for PrekeyDirectory<S>
where
    S: PrekeyStore,
{
    type Error = S::Error;

    async fn claim(
        &self,
        device: &DeviceAddress,
    ) -> Result<PrekeyBundle, PrekeyDirectoryError<Self::Error>> {
        PrekeyDirectory::claim(self, device).await
    }

    async fn signed_prekey_bundle(
        &self,
        device: &DeviceAddress,
    ) -> Result<PrekeyBundle, PrekeyDirectoryError<Self::Error>> {
        PrekeyDirectory::signed_prekey_bundle(self, device).await
    }

    async fn identity_key(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<PublicKey>, PrekeyDirectoryError<Self::Error>> {
        PrekeyDirectory::identity_key(self, device).await
    }
}

#[derive(Debug, Error)]
pub enum PrekeyDirectoryError<E>
where
    E: Debug + Display,
{
    #[error("{0}")]
    Store(E),

    #[error("signature of signed pre-key from {0} does not match its identity key")]
    InvalidSignature(DeviceAddress),

    #[error("identity key of {0} does not match the published one")]
    IdentityMismatch(DeviceAddress),

    #[error("signed pre-key {1} of {0} is expired or not valid yet")]
    ExpiredPrekey(DeviceAddress, PreKeyId),

    #[error("no one-time pre-keys available for {0}")]
    NoPrekeysAvailable(DeviceAddress),

    #[error("device {0} is not known to the directory")]
    DeviceUnknown(DeviceAddress),
}

impl<E> PrekeyDirectoryError<E>
where
    E: Debug + Display,
{
    pub fn class(&self) -> ErrorClass {
        match self {
            PrekeyDirectoryError::InvalidSignature(_)
            | PrekeyDirectoryError::IdentityMismatch(_) => ErrorClass::ProtocolViolation,
            PrekeyDirectoryError::Store(_)
            | PrekeyDirectoryError::ExpiredPrekey(_, _)
            | PrekeyDirectoryError::NoPrekeysAvailable(_)
            | PrekeyDirectoryError::DeviceUnknown(_) => ErrorClass::KeyAvailability,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::crypto::Rng;
    use crate::device::DeviceAddress;
    use crate::key_bundle::Lifetime;
    use crate::key_store::{KeyStore, KeyStoreState};
    use crate::memory_store::MemoryStore;
    use crate::time::now;

    use super::{PrekeyDirectory, PrekeyDirectoryError};

    async fn publish(
        directory: &PrekeyDirectory<MemoryStore>,
        device: &DeviceAddress,
        y: KeyStoreState,
        count: usize,
        rng: &Rng,
    ) -> KeyStoreState {
        let (y, onetime_prekeys) = KeyStore::generate_onetime_prekeys(y, count, rng).unwrap();
        let (signed_prekey, signature) = KeyStore::publication(&y).unwrap();
        directory
            .publish(
                device,
                &KeyStore::export_public_identity(&y),
                &signed_prekey,
                &signature,
                &onetime_prekeys,
            )
            .await
            .unwrap();
        y
    }

    #[tokio::test]
    async fn publish_and_claim() {
        let rng = Rng::from_seed([1; 32]);
        let directory = PrekeyDirectory::new(MemoryStore::new());
        let bob = DeviceAddress::new("bob", "phone");

        let y = KeyStore::init(&rng, Lifetime::default()).unwrap();
        let y = publish(&directory, &bob, y, 2, &rng).await;
        assert_eq!(directory.onetime_prekey_count(&bob).await.unwrap(), 2);

        let bundle_1 = directory.claim(&bob).await.unwrap();
        let bundle_2 = directory.claim(&bob).await.unwrap();
        assert!(bundle_1.verify().is_ok());
        assert_eq!(bundle_1.identity_key(), &KeyStore::export_public_identity(&y));
        assert_ne!(bundle_1.onetime_prekey_id(), bundle_2.onetime_prekey_id());

        assert_matches!(
            directory.claim(&bob).await,
            Err(PrekeyDirectoryError::NoPrekeysAvailable(_))
        );

        // Fallback bundle without one-time pre-key.
        let fallback = directory.signed_prekey_bundle(&bob).await.unwrap();
        assert_eq!(fallback.onetime_prekey(), None);
        assert_eq!(fallback.signed_prekey(), bundle_1.signed_prekey());

        assert_matches!(
            directory.claim(&DeviceAddress::new("bob", "laptop")).await,
            Err(PrekeyDirectoryError::DeviceUnknown(_))
        );
    }

    #[tokio::test]
    async fn publish_is_idempotent() {
        let rng = Rng::from_seed([1; 32]);
        let directory = PrekeyDirectory::new(MemoryStore::new());
        let bob = DeviceAddress::new("bob", "phone");

        let y = KeyStore::init(&rng, Lifetime::default()).unwrap();
        let (y, onetime_prekeys) = KeyStore::generate_onetime_prekeys(y, 3, &rng).unwrap();
        let (signed_prekey, signature) = KeyStore::publication(&y).unwrap();
        let identity_key = KeyStore::export_public_identity(&y);

        let added = directory
            .publish(&bob, &identity_key, &signed_prekey, &signature, &onetime_prekeys)
            .await
            .unwrap();
        assert_eq!(added, 3);

        // Claimed pre-keys do not come back when publishing the same batch again.
        directory.claim(&bob).await.unwrap();
        let added = directory
            .publish(&bob, &identity_key, &signed_prekey, &signature, &onetime_prekeys)
            .await
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(directory.onetime_prekey_count(&bob).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reject_invalid_publications() {
        let rng = Rng::from_seed([1; 32]);
        let directory = PrekeyDirectory::new(MemoryStore::new());
        let bob = DeviceAddress::new("bob", "phone");

        let y = KeyStore::init(&rng, Lifetime::default()).unwrap();
        let (signed_prekey, signature) = KeyStore::publication(&y).unwrap();
        let identity_key = KeyStore::export_public_identity(&y);

        let y_other = KeyStore::init(&rng, Lifetime::default()).unwrap();
        let (other_prekey, other_signature) = KeyStore::publication(&y_other).unwrap();
        let other_identity_key = KeyStore::export_public_identity(&y_other);

        // Signature by another identity.
        assert_matches!(
            directory
                .publish(&bob, &identity_key, &other_prekey, &other_signature, &[])
                .await,
            Err(PrekeyDirectoryError::InvalidSignature(_))
        );

        directory
            .publish(&bob, &identity_key, &signed_prekey, &signature, &[])
            .await
            .unwrap();

        // Identity key of a known device can't change.
        assert_matches!(
            directory
                .publish(
                    &bob,
                    &other_identity_key,
                    &other_prekey,
                    &other_signature,
                    &[]
                )
                .await,
            Err(PrekeyDirectoryError::IdentityMismatch(_))
        );

        // Expired signed pre-keys are rejected.
        let now = now();
        let (y, expired, expired_signature) =
            KeyStore::rotate_signed_prekey(y, Lifetime::from_range(now - 120, now - 60), &rng)
                .unwrap();
        assert_matches!(
            directory
                .publish(&bob, &identity_key, &expired, &expired_signature, &[])
                .await,
            Err(PrekeyDirectoryError::ExpiredPrekey(_, _))
        );

        // Newer signed pre-keys replace older ones.
        let (_y, rotated, rotated_signature) =
            KeyStore::rotate_signed_prekey(y, Lifetime::default(), &rng).unwrap();
        directory
            .publish(&bob, &identity_key, &rotated, &rotated_signature, &[])
            .await
            .unwrap();
        assert_eq!(
            directory
                .signed_prekey_bundle(&bob)
                .await
                .unwrap()
                .signed_prekey(),
            &rotated
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claims_are_exactly_once() {
        let rng = Rng::from_seed([1; 32]);
        let directory = Arc::new(PrekeyDirectory::new(MemoryStore::new()));
        let bob = DeviceAddress::new("bob", "phone");

        let y = KeyStore::init(&rng, Lifetime::default()).unwrap();
        publish(&directory, &bob, y, 16, &rng).await;

        let mut handles = Vec::new();
        for _ in 0..64 {
            let directory = directory.clone();
            let bob = bob.clone();
            handles.push(tokio::spawn(async move {
                directory
                    .claim(&bob)
                    .await
                    .ok()
                    .and_then(|bundle| bundle.onetime_prekey_id())
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                claimed.push(id);
            }
        }

        // Every pre-key was handed out exactly once.
        assert_eq!(claimed.len(), 16);
        let unique: HashSet<u64> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), 16);
        assert_eq!(directory.onetime_prekey_count(&bob).await.unwrap(), 0);
    }
}
