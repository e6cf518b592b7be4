use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::bail;
use common::{Credentials, PASSPHRASE_KEY, SSID_KEY};

use super::CredentialStore;
use crate::lock;

/// In-memory store with failure injection, for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    committed: Mutex<HashMap<String, String>>,
    staged: Mutex<HashMap<String, String>>,
    fail_set: AtomicBool,
    fail_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: &Credentials) -> Self {
        let store = Self::new();
        {
            let mut committed = lock(&store.committed);
            committed.insert(SSID_KEY.to_string(), credentials.ssid.clone());
            committed.insert(PASSPHRASE_KEY.to_string(), credentials.passphrase.clone());
        }
        store
    }

    pub fn fail_set(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn committed(&self, key: &str) -> Option<String> {
        lock(&self.committed).get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.committed).is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.committed(key))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            bail!("storage rejected `{}`", key);
        }
        lock(&self.staged).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn commit(&self) -> anyhow::Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            bail!("storage commit failed");
        }
        let staged = std::mem::take(&mut *lock(&self.staged));
        lock(&self.committed).extend(staged);
        Ok(())
    }
}
