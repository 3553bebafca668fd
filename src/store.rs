//! Durable storage for the key ring.
//!
//! Stores are additive: `save` upserts keys and never removes any, so an
//! instance holding a stale ring cannot erase a key another instance just
//! provisioned. Keys are only ever removed through `delete`, which the key
//! manager calls once a key can no longer protect a live cookie.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::OidcError;
use crate::keyring::{KeyRing, ProtectionKey};

const KEY_FILE_PREFIX: &str = "key-";
const KEY_FILE_SUFFIX: &str = ".json";

pub trait KeyMaterialStore: Send + Sync {
    /// Every persisted key; an empty ring when nothing has been saved yet.
    fn load(&self) -> Result<KeyRing, OidcError>;

    /// Persists every key of `ring` that the store does not hold yet.
    fn save(&self, ring: &KeyRing) -> Result<(), OidcError>;

    fn delete(&self, key_id: &str) -> Result<(), OidcError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    application: String,
    #[serde(flatten)]
    key: ProtectionKey,
}

/// One JSON record per key under `<root>/<application>/`.
///
/// Each record is written to a temporary file in the same directory, synced
/// and renamed into place, so readers see either no record or a complete one.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
    application: String,
}

impl FileKeyStore {
    pub fn new(root: impl AsRef<Path>, application: &str) -> Result<Self, OidcError> {
        validate_name("application name", application)?;

        let dir = root.as_ref().join(application);
        fs::create_dir_all(&dir).map_err(|e| store_error("create key directory", e))?;

        Ok(Self {
            dir,
            application: application.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key_id: &str) -> PathBuf {
        self.dir
            .join(format!("{KEY_FILE_PREFIX}{key_id}{KEY_FILE_SUFFIX}"))
    }

    fn write_record(&self, key: &ProtectionKey) -> Result<(), OidcError> {
        validate_name("key id", &key.id)?;
        let path = self.key_path(&key.id);
        if path.exists() {
            return Ok(());
        }

        let record = StoredKey {
            application: self.application.clone(),
            key: key.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| store_error("create temp file", e))?;
        tmp.write_all(&bytes)
            .map_err(|e| store_error("write key record", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| store_error("sync key record", e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(key_id = %key.id, path = %path.display(), "persisted key record");
                Ok(())
            }
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(store_error("persist key record", err.error)),
        }
    }
}

impl KeyMaterialStore for FileKeyStore {
    fn load(&self) -> Result<KeyRing, OidcError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(KeyRing::new()),
            Err(err) => return Err(store_error("read key directory", err)),
        };

        let mut ring = KeyRing::new();
        for entry in entries {
            let entry = entry.map_err(|e| store_error("read key directory", e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(KEY_FILE_PREFIX) || !name.ends_with(KEY_FILE_SUFFIX) {
                continue;
            }

            let raw = match fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                // Deleted by a concurrent prune between listing and reading.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(store_error("read key record", err)),
            };
            let record: StoredKey = serde_json::from_str(&raw).map_err(|e| {
                OidcError::KeyStore(format!("corrupt key record {name}: {e}"))
            })?;

            if record.application != self.application {
                warn!(
                    record = name,
                    application = %record.application,
                    "skipping key record of another application"
                );
                continue;
            }
            ring.insert(record.key);
        }

        Ok(ring)
    }

    fn save(&self, ring: &KeyRing) -> Result<(), OidcError> {
        ring.keys().iter().try_for_each(|key| self.write_record(key))
    }

    fn delete(&self, key_id: &str) -> Result<(), OidcError> {
        validate_name("key id", key_id)?;
        match fs::remove_file(self.key_path(key_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(store_error("delete key record", err)),
        }
    }
}

/// Process-local store. Sharing one instance through an `Arc` gives several
/// pipelines the same ring.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    ring: RwLock<KeyRing>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyMaterialStore for MemoryKeyStore {
    fn load(&self) -> Result<KeyRing, OidcError> {
        self.ring
            .read()
            .map(|ring| ring.clone())
            .map_err(|_| OidcError::KeyStore("key ring lock poisoned".to_string()))
    }

    fn save(&self, ring: &KeyRing) -> Result<(), OidcError> {
        self.ring
            .write()
            .map(|mut stored| stored.merge(ring))
            .map_err(|_| OidcError::KeyStore("key ring lock poisoned".to_string()))
    }

    fn delete(&self, key_id: &str) -> Result<(), OidcError> {
        self.ring
            .write()
            .map(|mut stored| {
                stored.remove(key_id);
            })
            .map_err(|_| OidcError::KeyStore("key ring lock poisoned".to_string()))
    }
}

fn validate_name(what: &str, value: &str) -> Result<(), OidcError> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !value.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(OidcError::KeyStore(format!(
            "{what} must be 1-128 characters of [A-Za-z0-9._-] and not start with '.'"
        )))
    }
}

fn store_error(action: &str, err: std::io::Error) -> OidcError {
    OidcError::KeyStore(format!("{action}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ProtectionKey {
        ProtectionKey::generate(100, 100, 1_000)
    }

    #[test]
    fn empty_store_loads_empty_ring() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), "app").unwrap();
        assert!(store.load().unwrap().is_empty());
        assert!(MemoryKeyStore::new().load().unwrap().is_empty());
    }

    #[test]
    fn file_store_round_trips_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), "app").unwrap();
        let ring = KeyRing::from_keys([key(), key()]);

        store.save(&ring).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.len(), 2);
        for k in ring.keys() {
            assert!(loaded.keys().contains(k));
        }
    }

    #[test]
    fn saves_from_stale_rings_are_additive() {
        let dir = tempfile::tempdir().unwrap();
        let instance_a = FileKeyStore::new(dir.path(), "app").unwrap();
        let instance_b = FileKeyStore::new(dir.path(), "app").unwrap();

        let shared = key();
        instance_a
            .save(&KeyRing::from_keys([shared.clone(), key()]))
            .unwrap();
        instance_b
            .save(&KeyRing::from_keys([shared, key()]))
            .unwrap();

        assert_eq!(instance_a.load().unwrap().len(), 3);
        assert_eq!(instance_b.load().unwrap().len(), 3);
    }

    #[test]
    fn applications_are_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let web = FileKeyStore::new(dir.path(), "web").unwrap();
        let admin = FileKeyStore::new(dir.path(), "admin").unwrap();

        web.save(&KeyRing::from_keys([key()])).unwrap();
        assert_eq!(web.load().unwrap().len(), 1);
        assert!(admin.load().unwrap().is_empty());
    }

    #[test]
    fn foreign_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), "web").unwrap();
        let foreign = StoredKey {
            application: "other".to_string(),
            key: key(),
        };
        fs::write(
            store.dir().join("key-foreign.json"),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .unwrap();

        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn temp_files_are_ignored_and_corrupt_records_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), "app").unwrap();
        store.save(&KeyRing::from_keys([key()])).unwrap();

        fs::write(store.dir().join(".tmpHALF"), b"{\"appl").unwrap();
        assert_eq!(store.load().unwrap().len(), 1);

        fs::write(store.dir().join("key-broken.json"), b"{\"appl").unwrap();
        match store.load() {
            Err(OidcError::KeyStore(msg)) => assert!(msg.contains("key-broken.json")),
            other => panic!("expected key store error, got {other:?}"),
        }
    }

    #[test]
    fn delete_removes_single_key_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), "app").unwrap();
        let (k1, k2) = (key(), key());
        store.save(&KeyRing::from_keys([k1.clone(), k2.clone()])).unwrap();

        store.delete(&k1.id).unwrap();
        store.delete(&k1.id).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.keys()[0].id, k2.id);
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileKeyStore::new(dir.path(), "../escape").is_err());
        assert!(FileKeyStore::new(dir.path(), "").is_err());

        let store = FileKeyStore::new(dir.path(), "app").unwrap();
        assert!(store.delete("../../etc/passwd").is_err());
    }

    #[test]
    fn memory_store_merges_and_deletes() {
        let store = MemoryKeyStore::new();
        let (k1, k2) = (key(), key());
        store.save(&KeyRing::from_keys([k1.clone()])).unwrap();
        store.save(&KeyRing::from_keys([k2.clone()])).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);

        store.delete(&k1.id).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.keys(), std::slice::from_ref(&k2));
    }
}
