// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise sessions between exactly two devices.
//!
//! Used directly for 1:1 messages and as secure transport for group session keys.
mod message;
mod session;
mod x3dh;

pub use message::{PairwiseMessage, PreKeyInfo, RatchetHeader};
pub use session::{PairwiseError, PairwiseResult, PairwiseSession, PairwiseSessionState};
pub use x3dh::X3DHError;
