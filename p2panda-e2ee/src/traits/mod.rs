// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to storage and transport layers.
//!
//! The protocol engine does not persist anything nor talk to the network by itself. Prekeys are
//! published to and claimed from a [`PrekeyStore`], remote devices are reached through a
//! [`PrekeyProvider`] and session shares travel through a [`ShareMailbox`].
mod prekey_provider;
mod prekey_store;
mod share_mailbox;

pub use prekey_provider::PrekeyProvider;
pub use prekey_store::PrekeyStore;
pub use share_mailbox::ShareMailbox;
