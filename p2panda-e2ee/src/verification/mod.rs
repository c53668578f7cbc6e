// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interactive verification of device identities with short authentication strings (SAS).
//!
//! Two users compare a short string on their devices. The strings are derived from an ephemeral
//! key exchange, a machine in the middle would cause them to differ. The initiator commits to its
//! ephemeral key before it learns the responder's, so it can't choose a key producing a
//! colliding string.
//!
//! ```text
//! Initiator                               Responder
//!     Start { commitment }        ------>
//!                                 <------ Accept { public_key }
//!     KeyExchange { public_key }  ------>
//!          (both users compare the strings)
//!     Confirm { identity_key, mac } <---> Confirm { identity_key, mac }
//! ```
mod engine;
mod message;
mod sas;

pub use engine::{Transition, VerificationEngine, VerificationError, VerificationStatus};
pub use message::{CancelReason, Commitment, Mac, TransactionId, VerificationMessage};
pub use sas::{EMOJI, Emoji, Sas};
