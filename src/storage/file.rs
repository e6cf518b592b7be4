use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use log::debug;

use super::CredentialStore;
use crate::lock;

struct Maps {
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
}

/// JSON file backed store. `set` stages in memory, `commit` writes the whole
/// map to a sibling temp file and renames it into place.
pub struct FileStore {
    path: PathBuf,
    maps: Mutex<Maps>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let committed = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
        } else {
            debug!("storage: {} does not exist yet", path.display());
            BTreeMap::new()
        };

        Ok(Self {
            path,
            maps: Mutex::new(Maps {
                staged: committed.clone(),
                committed,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.maps).committed.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        lock(&self.maps)
            .staged
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn commit(&self) -> anyhow::Result<()> {
        let mut maps = lock(&self.maps);
        let json = serde_json::to_string_pretty(&maps.staged)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;

        maps.committed = maps.staged.clone();
        debug!("storage: committed {} key(s) to {}", maps.committed.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_credentials, save_credentials};
    use common::{Credentials, SSID_KEY};

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("credentials.json")).unwrap();
        assert_eq!(store.get(SSID_KEY).unwrap(), None);
        assert_eq!(load_credentials(&store), None);
    }

    #[test]
    fn test_set_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = FileStore::open(&path).unwrap();

        store.set(SSID_KEY, "HomeNet").unwrap();
        assert_eq!(store.get(SSID_KEY).unwrap(), None);
        assert!(!path.exists());

        store.commit().unwrap();
        assert_eq!(store.get(SSID_KEY).unwrap().as_deref(), Some("HomeNet"));
    }

    #[test]
    fn test_committed_pair_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let credentials = Credentials::new("HomeNet", "secret123");
        save_credentials(&FileStore::open(&path).unwrap(), &credentials).unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(load_credentials(&reopened), Some(credentials));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }

    #[test]
    fn test_commit_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("gone").join("credentials.json")).unwrap();
        store.set(SSID_KEY, "HomeNet").unwrap();
        assert!(store.commit().is_err());
        assert_eq!(store.get(SSID_KEY).unwrap(), None);
    }
}
