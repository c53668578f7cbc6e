// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers to run several devices against one in-memory directory and mailbox.
use crate::Config;
use crate::account::Account;
use crate::codec::MessageCodec;
use crate::crypto::Rng;
use crate::device::DeviceAddress;
use crate::memory_store::MemoryStore;
use crate::prekey_directory::PrekeyDirectory;

pub type TestCodec = MessageCodec<PrekeyDirectory<MemoryStore>, MemoryStore>;

/// Directory and mailbox shared by all devices of a test.
#[derive(Clone, Debug)]
pub struct TestNetwork {
    config: Config,
    directory: PrekeyDirectory<MemoryStore>,
    mailbox: MemoryStore,
}

impl TestNetwork {
    pub fn new(config: Config) -> Self {
        let store = MemoryStore::new();
        Self {
            config,
            directory: PrekeyDirectory::new(store.clone()),
            mailbox: store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &PrekeyDirectory<MemoryStore> {
        &self.directory
    }

    pub fn mailbox(&self) -> &MemoryStore {
        &self.mailbox
    }

    /// Creates a device with a deterministic random number generator and publishes its pre-keys.
    pub async fn join(&self, user_id: &str, device_id: &str, seed: u8) -> TestCodec {
        let rng = Rng::from_seed([seed; 32]);
        let mut account = Account::new(DeviceAddress::new(user_id, device_id), &self.config, &rng)
            .expect("create account");
        account
            .publish_prekeys(&self.directory, &self.config, &rng)
            .await
            .expect("publish pre-keys");

        MessageCodec::new(
            account,
            self.config.clone(),
            rng,
            self.directory.clone(),
            self.mailbox.clone(),
        )
    }
}
