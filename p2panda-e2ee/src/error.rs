// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Classes of failures and how callers can recover from them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// No pre-keys or unknown device. Recoverable by falling back or retrying later.
    KeyAvailability,

    /// Unknown session, session mismatch or message before join window. Recoverable by requesting
    /// a fresh session share, never by guessing ratchet state.
    SessionState,

    /// Ciphertext or signature did not authenticate. Terminal for that message.
    Authentication,

    /// Peer violated the protocol. Terminal for the session and revokes partial trust.
    ProtocolViolation,

    /// Entropy or configuration problem. Not retryable, surface to the operator.
    Fatal,
}
