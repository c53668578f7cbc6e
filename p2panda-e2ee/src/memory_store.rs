// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementation of the pre-key storage and session share mailbox.
//!
//! Useful for tests and for running the directory in-process. Everything is lost when the store
//! is dropped.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::crypto::x25519::PublicKey;
use crate::crypto::xeddsa::XSignature;
use crate::device::DeviceAddress;
use crate::distributor::SessionShare;
use crate::key_bundle::{OneTimePreKey, OneTimePreKeyId, SignedPreKey};
use crate::traits::{PrekeyStore, ShareMailbox};
use crate::types::ShareId;

#[derive(Debug, Default)]
struct MemoryStoreInner {
    identity_keys: HashMap<DeviceAddress, PublicKey>,
    signed_prekeys: HashMap<DeviceAddress, (SignedPreKey, XSignature)>,
    onetime_prekeys: HashMap<DeviceAddress, BTreeMap<OneTimePreKeyId, OneTimePreKey>>,
    published_onetime_ids: HashMap<DeviceAddress, HashSet<OneTimePreKeyId>>,
    shares: HashMap<DeviceAddress, Vec<SessionShare>>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrekeyStore for MemoryStore {
    type Error = Infallible;

    async fn identity_key(&self, device: &DeviceAddress) -> Result<Option<PublicKey>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.identity_keys.get(device).copied())
    }

    async fn set_identity_key(
        &self,
        device: &DeviceAddress,
        identity_key: &PublicKey,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.identity_keys.insert(device.clone(), *identity_key);
        Ok(())
    }

    async fn signed_prekey(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<(SignedPreKey, XSignature)>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.signed_prekeys.get(device).copied())
    }

    async fn set_signed_prekey(
        &self,
        device: &DeviceAddress,
        prekey: &SignedPreKey,
        signature: &XSignature,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner
            .signed_prekeys
            .insert(device.clone(), (*prekey, *signature));
        Ok(())
    }

    async fn add_onetime_prekeys(
        &self,
        device: &DeviceAddress,
        prekeys: &[OneTimePreKey],
    ) -> Result<usize, Self::Error> {
        let mut inner = self.inner.write().await;
        let MemoryStoreInner {
            onetime_prekeys,
            published_onetime_ids,
            ..
        } = &mut *inner;

        let published = published_onetime_ids.entry(device.clone()).or_default();
        let available = onetime_prekeys.entry(device.clone()).or_default();

        let mut added = 0;
        for prekey in prekeys {
            if published.insert(prekey.id()) {
                available.insert(prekey.id(), prekey.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn claim_onetime_prekey(
        &self,
        device: &DeviceAddress,
    ) -> Result<Option<OneTimePreKey>, Self::Error> {
        // Holding the write lock makes claim-and-remove one atomic step.
        let mut inner = self.inner.write().await;
        Ok(inner
            .onetime_prekeys
            .get_mut(device)
            .and_then(|prekeys| prekeys.pop_first())
            .map(|(_, prekey)| prekey))
    }

    async fn onetime_prekey_count(&self, device: &DeviceAddress) -> Result<usize, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .onetime_prekeys
            .get(device)
            .map(|prekeys| prekeys.len())
            .unwrap_or(0))
    }
}

impl ShareMailbox for MemoryStore {
    type Error = Infallible;

    async fn send_share(&self, share: SessionShare) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner
            .shares
            .entry(share.recipient().clone())
            .or_default()
            .push(share);
        Ok(())
    }

    async fn fetch_pending(
        &self,
        recipient: &DeviceAddress,
    ) -> Result<Vec<SessionShare>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.shares.get(recipient).cloned().unwrap_or_default())
    }

    async fn mark_claimed(
        &self,
        recipient: &DeviceAddress,
        share_id: &ShareId,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        if let Some(shares) = inner.shares.get_mut(recipient) {
            shares.retain(|share| share.share_id() != share_id);
        }
        Ok(())
    }
}
