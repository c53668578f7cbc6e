// SPDX-License-Identifier: MIT OR Apache-2.0

//! Arena of all pairwise and group sessions of one device.
//!
//! Sessions are owned by the caller and looked up by id, there is no global state. Ratchets are
//! advanced by taking a copy out of the store and putting the advanced state back, so a failed
//! operation never leaves a half-updated session behind.
//!
//! Besides the current session, only a few of the most recent pairwise sessions per device are
//! kept around to decrypt messages still in flight. Older ones are dropped.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::DeviceAddress;
use crate::group::{InboundGroupSessionState, OutboundGroupSessionState};
use crate::pairwise::PairwiseSessionState;
use crate::types::{ConversationId, SessionId};

/// Number of replaced pairwise sessions kept per device next to the current one.
pub(crate) const MAX_STALE_PAIRWISE_SESSIONS: usize = 3;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionStore {
    pairwise: HashMap<SessionId, PairwiseEntry>,
    current_pairwise: HashMap<DeviceAddress, SessionId>,
    outbound_group: HashMap<ConversationId, OutboundGroupSessionState>,
    inbound_group: HashMap<SessionId, InboundGroupSessionState>,
    pairwise_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PairwiseEntry {
    peer: DeviceAddress,
    state: PairwiseSessionState,
    last_used: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairwise(&self, session_id: &SessionId) -> Option<&PairwiseSessionState> {
        self.pairwise.get(session_id).map(|entry| &entry.state)
    }

    /// Device on the other end of a pairwise session.
    pub fn pairwise_peer(&self, session_id: &SessionId) -> Option<&DeviceAddress> {
        self.pairwise.get(session_id).map(|entry| &entry.peer)
    }

    /// Session used when sending to the given device.
    pub fn current_pairwise(&self, peer: &DeviceAddress) -> Option<&PairwiseSessionState> {
        self.current_pairwise
            .get(peer)
            .and_then(|session_id| self.pairwise(session_id))
    }

    /// Inserts a new pairwise session and makes it the current one for that device.
    ///
    /// Replaced sessions of that device beyond the most recently used ones are dropped.
    pub(crate) fn insert_pairwise(&mut self, peer: DeviceAddress, state: PairwiseSessionState) {
        let session_id = state.session_id();
        debug!(%session_id, %peer, "set current pairwise session");
        self.current_pairwise.insert(peer.clone(), session_id);
        let last_used = self.next_seq();
        self.pairwise.insert(
            session_id,
            PairwiseEntry {
                peer: peer.clone(),
                state,
                last_used,
            },
        );
        self.prune_pairwise(&peer, session_id);
    }

    /// Replaces the state of a known pairwise session after it advanced.
    pub(crate) fn update_pairwise(&mut self, state: PairwiseSessionState) {
        let last_used = self.next_seq();
        if let Some(entry) = self.pairwise.get_mut(&state.session_id()) {
            entry.state = state;
            entry.last_used = last_used;
        }
    }

    fn prune_pairwise(&mut self, peer: &DeviceAddress, current: SessionId) {
        let mut stale: Vec<(u64, SessionId)> = self
            .pairwise
            .iter()
            .filter(|(session_id, entry)| &entry.peer == peer && **session_id != current)
            .map(|(session_id, entry)| (entry.last_used, *session_id))
            .collect();
        if stale.len() <= MAX_STALE_PAIRWISE_SESSIONS {
            return;
        }

        // Most recently used first.
        stale.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, session_id) in stale.into_iter().skip(MAX_STALE_PAIRWISE_SESSIONS) {
            debug!(%session_id, %peer, "drop stale pairwise session");
            self.pairwise.remove(&session_id);
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.pairwise_seq += 1;
        self.pairwise_seq
    }

    pub fn outbound_group(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<&OutboundGroupSessionState> {
        self.outbound_group.get(conversation_id)
    }

    pub(crate) fn set_outbound_group(&mut self, state: OutboundGroupSessionState) {
        self.outbound_group
            .insert(state.conversation_id().clone(), state);
    }

    pub fn inbound_group(&self, session_id: &SessionId) -> Option<&InboundGroupSessionState> {
        self.inbound_group.get(session_id)
    }

    /// Inserts an imported group session.
    ///
    /// A session we already know is only replaced when the new copy comes from the same sender
    /// and reaches further back. Returns false if the session was ignored.
    pub(crate) fn insert_inbound_group(&mut self, state: InboundGroupSessionState) -> bool {
        match self.inbound_group.get(&state.session_id()) {
            Some(existing)
                if existing.sender() != state.sender()
                    || existing.sender_identity_key() != state.sender_identity_key() =>
            {
                false
            }
            Some(existing) if existing.first_known_index() <= state.first_known_index() => false,
            Some(existing) => {
                let state = state.keep_decrypted(existing);
                self.inbound_group.insert(state.session_id(), state);
                true
            }
            None => {
                self.inbound_group.insert(state.session_id(), state);
                true
            }
        }
    }

    pub(crate) fn update_inbound_group(&mut self, state: InboundGroupSessionState) {
        self.inbound_group.insert(state.session_id(), state);
    }
}
