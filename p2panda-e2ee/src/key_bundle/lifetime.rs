// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::{Timestamp, now};

/// Default lifetime of a signed pre-key: 90 days.
const DEFAULT_LIFETIME: u64 = 60 * 60 * 24 * 90;

/// Time window in which a signed pre-key is considered valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    not_before: Timestamp,
    not_after: Timestamp,
}

impl Lifetime {
    /// Lifetime starting now and ending after the given number of seconds.
    pub fn new(seconds: u64) -> Self {
        let now = now();
        Self {
            not_before: now,
            not_after: now.saturating_add(seconds),
        }
    }

    pub fn from_range(not_before: Timestamp, not_after: Timestamp) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn not_before(&self) -> Timestamp {
        self.not_before
    }

    pub fn not_after(&self) -> Timestamp {
        self.not_after
    }

    pub fn verify(&self) -> Result<(), LifetimeError> {
        self.verify_at(now())
    }

    pub fn verify_at(&self, timestamp: Timestamp) -> Result<(), LifetimeError> {
        if timestamp < self.not_before {
            return Err(LifetimeError::TooEarly(self.not_before));
        }
        if timestamp > self.not_after {
            return Err(LifetimeError::Expired(self.not_after));
        }
        Ok(())
    }

    pub(crate) fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.not_before.to_be_bytes());
        bytes[8..].copy_from_slice(&self.not_after.to_be_bytes());
        bytes
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new(DEFAULT_LIFETIME)
    }
}

#[derive(Debug, Error)]
pub enum LifetimeError {
    #[error("pre-key expired at {0}")]
    Expired(Timestamp),

    #[error("pre-key is not valid before {0}")]
    TooEarly(Timestamp),
}
