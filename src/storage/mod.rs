//! Persistent key/value storage for the provisioned credentials

use common::{CredentialField, Credentials};
use log::{info, warn};

use crate::error::ProvisionError;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Staged key/value store. Values written with `set` become durable on `commit`.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn commit(&self) -> anyhow::Result<()>;
}

/// Read both halves of a stored pair. A missing half, or an unreadable store,
/// counts as no credentials.
pub fn load_credentials(store: &dyn CredentialStore) -> Option<Credentials> {
    let read = |field: CredentialField| match store.get(field.storage_key()) {
        Ok(value) => value.filter(|v| !v.is_empty()),
        Err(e) => {
            warn!("storage: failed to read `{}`: {:#}", field.storage_key(), e);
            None
        }
    };

    let ssid = read(CredentialField::Ssid)?;
    let passphrase = read(CredentialField::Passphrase)?;
    Some(Credentials { ssid, passphrase })
}

pub fn save_credentials(
    store: &dyn CredentialStore,
    credentials: &Credentials,
) -> Result<(), ProvisionError> {
    for field in [CredentialField::Ssid, CredentialField::Passphrase] {
        store
            .set(field.storage_key(), credentials.get(field))
            .map_err(ProvisionError::PersistenceFailure)?;
    }
    store.commit().map_err(ProvisionError::PersistenceFailure)?;

    info!("storage: credentials for `{}` committed", credentials.ssid);
    Ok(())
}
