// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key_bundle::Lifetime;

/// Configuration for the protocol engine of one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// When a signed pre-key should be considered expired and thus invalid.
    pub(crate) prekey_lifetime: Duration,

    /// Rotate our own signed pre-key after this duration, to allow some time between peers
    /// receiving our new one and the old one expiring.
    pub(crate) prekey_rotate_after: Duration,

    /// Number of one-time pre-keys generated and published in one batch.
    pub(crate) onetime_prekey_batch_size: usize,

    /// Replenish one-time pre-keys when fewer than this number is left in the directory.
    pub(crate) onetime_prekey_low_watermark: usize,

    /// Maximum number of message keys a pairwise chain may skip ahead in one step.
    pub(crate) max_skip: u64,

    /// Maximum number of skipped pairwise message keys kept around for late messages.
    pub(crate) max_skipped_message_keys: usize,

    /// Maximum number of ratchet steps a group session may advance in one decryption.
    pub(crate) max_group_index_jump: u64,

    /// Number of decrypted group message indices remembered per session to reject replays.
    /// Messages older than the remembered ones are rejected as well.
    pub(crate) group_replay_window: usize,

    /// Supersede an outbound group session after this many messages.
    pub(crate) group_rotation_messages: u64,

    /// Supersede an outbound group session after it has been used for this duration.
    pub(crate) group_rotation_period: Duration,

    /// Interactive verifications idle for longer than this are expired.
    pub(crate) verification_timeout: Duration,

    /// Establish pairwise sessions with the signed pre-key only when no one-time pre-key is
    /// left, accepting weaker forward secrecy for the first message.
    pub(crate) signed_prekey_fallback: bool,

    /// Allow an explicit, unencrypted send when no recipient exposes any key material.
    pub(crate) unencrypted_fallback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prekey_lifetime: Duration::from_secs(60 * 60 * 24 * 90), // 90 days
            prekey_rotate_after: Duration::from_secs(60 * 60 * 24 * 60), // 60 days
            onetime_prekey_batch_size: 100,
            onetime_prekey_low_watermark: 10,
            max_skip: 1000,
            max_skipped_message_keys: 2000,
            max_group_index_jump: 100_000,
            group_replay_window: 2000,
            group_rotation_messages: 100,
            group_rotation_period: Duration::from_secs(60 * 60 * 24 * 7), // 7 days
            verification_timeout: Duration::from_secs(60 * 10),           // 10 minutes
            signed_prekey_fallback: true,
            unencrypted_fallback: false,
        }
    }
}

impl Config {
    pub fn with_prekey_lifetime(mut self, lifetime: Duration, rotate_after: Duration) -> Self {
        self.prekey_lifetime = lifetime;
        self.prekey_rotate_after = rotate_after;
        self
    }

    pub fn with_onetime_prekeys(mut self, batch_size: usize, low_watermark: usize) -> Self {
        self.onetime_prekey_batch_size = batch_size;
        self.onetime_prekey_low_watermark = low_watermark;
        self
    }

    pub fn with_max_skip(mut self, max_skip: u64, max_skipped_message_keys: usize) -> Self {
        self.max_skip = max_skip;
        self.max_skipped_message_keys = max_skipped_message_keys;
        self
    }

    pub fn with_max_group_index_jump(mut self, max_jump: u64) -> Self {
        self.max_group_index_jump = max_jump;
        self
    }

    pub fn with_group_replay_window(mut self, window: usize) -> Self {
        self.group_replay_window = window;
        self
    }

    pub fn with_group_rotation(mut self, messages: u64, period: Duration) -> Self {
        self.group_rotation_messages = messages;
        self.group_rotation_period = period;
        self
    }

    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn with_signed_prekey_fallback(mut self, enabled: bool) -> Self {
        self.signed_prekey_fallback = enabled;
        self
    }

    pub fn with_unencrypted_fallback(mut self, enabled: bool) -> Self {
        self.unencrypted_fallback = enabled;
        self
    }

    pub fn onetime_prekey_batch_size(&self) -> usize {
        self.onetime_prekey_batch_size
    }

    pub fn onetime_prekey_low_watermark(&self) -> usize {
        self.onetime_prekey_low_watermark
    }

    pub fn prekey_rotate_after(&self) -> Duration {
        self.prekey_rotate_after
    }

    pub fn verification_timeout(&self) -> Duration {
        self.verification_timeout
    }

    /// Lifetime for newly generated signed pre-keys, starting now.
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.prekey_lifetime.as_secs())
    }
}
