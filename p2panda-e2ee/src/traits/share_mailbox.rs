// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Debug, Display};

use crate::device::DeviceAddress;
use crate::distributor::SessionShare;
use crate::types::ShareId;

/// Queued delivery of session shares to (possibly offline) recipient devices.
///
/// Shares stay in the mailbox until the recipient marked them as claimed.
pub trait ShareMailbox {
    type Error: Debug + Display;

    fn send_share(&self, share: SessionShare) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns all unclaimed shares addressed to a device, in the order they were sent.
    fn fetch_pending(
        &self,
        recipient: &DeviceAddress,
    ) -> impl Future<Output = Result<Vec<SessionShare>, Self::Error>>;

    fn mark_claimed(
        &self,
        recipient: &DeviceAddress,
        share_id: &ShareId,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
