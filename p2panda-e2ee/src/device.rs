// SPDX-License-Identifier: MIT OR Apache-2.0

//! Devices are the cryptographic identities taking part in encrypted conversations.
//!
//! Every client installation is one device with a long-term identity key. The identity key of a
//! device never changes, a new key requires a new device id. Devices are never deleted, they get
//! retired when a user revokes them.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::x25519::PublicKey;
use crate::time::{Timestamp, now};

/// Address of a device: the user it belongs to and its stable, opaque device id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    user_id: String,
    device_id: String,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// How a device came to be trusted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMethod {
    /// Users compared a short authentication string of an interactive verification.
    Sas,

    /// An administrator vouched for the device.
    Administrative,

    /// Automated, always-present participant which is trusted without running a handshake.
    SystemTrusted,
}

/// Record of a remote (or our own) device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    address: DeviceAddress,
    identity_key: PublicKey,
    verified_at: Option<Timestamp>,
    verification_method: Option<VerificationMethod>,
    created_at: Timestamp,
    retired_at: Option<Timestamp>,
}

impl Device {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    pub fn is_verified(&self) -> bool {
        self.verification_method.is_some()
    }

    pub fn verified_at(&self) -> Option<Timestamp> {
        self.verified_at
    }

    pub fn verification_method(&self) -> Option<VerificationMethod> {
        self.verification_method
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// Trust level of a message sender, displayed next to decrypted messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trust {
    /// Device identity was verified.
    Verified(VerificationMethod),

    /// Device is known but was never verified.
    Unverified,

    /// Device was revoked by its user.
    Retired,

    /// Device is not known to us.
    Unknown,
}

/// Local registry of all devices we know about.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceAddress, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the identity key of a device.
    ///
    /// Registering the same key again is a no-op. Registering a different key for a known
    /// device fails, the identity of a device can never change.
    pub fn register(
        &mut self,
        address: &DeviceAddress,
        identity_key: &PublicKey,
    ) -> Result<&Device, DeviceError> {
        let device = self
            .devices
            .entry(address.clone())
            .or_insert_with(|| Device {
                address: address.clone(),
                identity_key: *identity_key,
                verified_at: None,
                verification_method: None,
                created_at: now(),
                retired_at: None,
            });

        if device.identity_key != *identity_key {
            return Err(DeviceError::IdentityKeyChanged(address.clone()));
        }

        Ok(device)
    }

    /// Registers an automated participant which is trusted without interactive verification.
    pub fn register_system_trusted(
        &mut self,
        address: &DeviceAddress,
        identity_key: &PublicKey,
    ) -> Result<(), DeviceError> {
        self.register(address, identity_key)?;
        self.mark_verified(address, VerificationMethod::SystemTrusted)
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Device> {
        self.devices.get(address)
    }

    pub fn identity_key(&self, address: &DeviceAddress) -> Option<&PublicKey> {
        self.devices.get(address).map(|device| &device.identity_key)
    }

    /// All non-retired devices of a user.
    pub fn active_devices(&self, user_id: &str) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self
            .devices
            .values()
            .filter(|device| device.address.user_id() == user_id && !device.is_retired())
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    pub fn mark_verified(
        &mut self,
        address: &DeviceAddress,
        method: VerificationMethod,
    ) -> Result<(), DeviceError> {
        let device = self
            .devices
            .get_mut(address)
            .ok_or_else(|| DeviceError::UnknownDevice(address.clone()))?;
        if device.is_retired() {
            return Err(DeviceError::Retired(address.clone()));
        }
        debug!(device = %address, ?method, "mark device as verified");
        device.verification_method = Some(method);
        device.verified_at = Some(now());
        Ok(())
    }

    /// Marks a device as verified by an administrator, without an interactive handshake.
    pub fn mark_administratively_verified(
        &mut self,
        address: &DeviceAddress,
    ) -> Result<(), DeviceError> {
        self.mark_verified(address, VerificationMethod::Administrative)
    }

    /// Logically retires a device. The record is kept but it won't receive new session keys.
    pub fn retire(&mut self, address: &DeviceAddress) -> Result<(), DeviceError> {
        let device = self
            .devices
            .get_mut(address)
            .ok_or_else(|| DeviceError::UnknownDevice(address.clone()))?;
        if device.retired_at.is_none() {
            debug!(device = %address, "retire device");
            device.retired_at = Some(now());
        }
        Ok(())
    }

    pub fn is_retired(&self, address: &DeviceAddress) -> bool {
        self.devices
            .get(address)
            .map(|device| device.is_retired())
            .unwrap_or(false)
    }

    pub fn trust(&self, address: &DeviceAddress) -> Trust {
        match self.devices.get(address) {
            None => Trust::Unknown,
            Some(device) if device.is_retired() => Trust::Retired,
            Some(device) => match device.verification_method {
                Some(method) => Trust::Verified(method),
                None => Trust::Unverified,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("identity key of device {0} changed, a new key requires a new device id")]
    IdentityKeyChanged(DeviceAddress),

    #[error("device {0} is not known")]
    UnknownDevice(DeviceAddress),

    #[error("device {0} was retired")]
    Retired(DeviceAddress),
}
