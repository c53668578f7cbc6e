// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group sessions: one sender-owned ratchet per conversation and sending device.
mod message;
mod session;

pub use message::{GroupMessage, GroupSessionKey};
pub use session::{
    GroupSession, GroupSessionError, GroupSessionResult, InboundGroupSessionState,
    OutboundGroupSessionState,
};
