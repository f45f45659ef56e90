//! Versioned tracking keys and the rotation protocol
//!
//! The key ring only grows: rotation adds version N+1 and moves the current
//! pointer forward, so pixels minted under any earlier version stay
//! decryptable. Encryption always uses the current version.
//!
//! `KeyStore` is not safe for concurrent `save`/`rotate` calls. Administrative
//! callers that might race must serialize access themselves.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::codec::{validate_key_version, KeySet, KeyVersion, TrackingKey};
use crate::config::TrackingConfig;
use crate::error::{Result, TrackingError};

/// Unversioned slot kept for readers that predate key versions
pub const LEGACY_TRACKING_KEY_SECRET: &str = "tracking_key";
pub const ADMIN_KEY_SECRET: &str = "admin_key";
pub const CURRENT_VERSION_SECRET: &str = "tracking_key_current_version";
pub const TRACKING_KEY_SECRET_PREFIX: &str = "tracking_key_v";

/// Secret name for a versioned tracking key
pub fn tracking_key_name(version: KeyVersion) -> String {
    format!("{}{}", TRACKING_KEY_SECRET_PREFIX, version)
}

/// Named secret storage (OS keyring, file, vault...)
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// Process-local secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let items = self
            .items
            .lock()
            .map_err(|_| TrackingError::Storage("secret store lock poisoned".to_string()))?;
        Ok(items.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| TrackingError::Storage("secret store lock poisoned".to_string()))?;
        items.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Secrets kept in a single JSON object file (mode 0600 on unix)
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(data) if data.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(TrackingError::Storage(format!(
                "read secrets {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(name))
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TrackingError::Storage("secret file lock poisoned".to_string()))?;
        let mut items = self.read_all()?;
        items.insert(name.to_string(), value.to_string());
        write_secret_file(&self.path, &serde_json::to_vec_pretty(&items)?)
    }
}

#[cfg(unix)]
fn write_secret_file(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, data)?;
    Ok(())
}

/// Loaded key material: every retained version plus the admin secret
#[derive(Debug, Clone)]
pub struct KeyRing {
    current_version: KeyVersion,
    keys: KeySet,
    admin_key: String,
}

impl KeyRing {
    /// Fails unless `keys` holds an entry for `current_version`
    pub fn new(current_version: KeyVersion, keys: KeySet, admin_key: impl Into<String>) -> Result<Self> {
        if !keys.contains_key(&current_version) {
            return Err(TrackingError::Validation(format!(
                "missing tracking key for current version {}",
                current_version
            )));
        }
        Ok(Self {
            current_version,
            keys,
            admin_key: admin_key.into(),
        })
    }

    pub fn current_version(&self) -> KeyVersion {
        self.current_version
    }

    /// Key used for every new pixel
    pub fn current_key(&self) -> &TrackingKey {
        // Constructor guarantees presence
        &self.keys[&self.current_version]
    }

    /// All retained keys, for decryption
    pub fn codec_keys(&self) -> &KeySet {
        &self.keys
    }

    pub fn versions(&self) -> Vec<KeyVersion> {
        self.keys.keys().copied().collect()
    }

    pub fn admin_key(&self) -> &str {
        &self.admin_key
    }
}

/// Result of a successful rotation, for the operator to distribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationReport {
    pub previous_version: KeyVersion,
    pub current_version: KeyVersion,
    pub retained_versions: Vec<KeyVersion>,
}

/// Key ring persistence over plaintext metadata plus a secret store
pub struct KeyStore {
    metadata: TrackingConfig,
    secrets: Arc<dyn SecretStore>,
}

impl KeyStore {
    pub fn new(mut metadata: TrackingConfig, secrets: Arc<dyn SecretStore>) -> Self {
        metadata.normalize();
        Self { metadata, secrets }
    }

    /// Plaintext metadata, updated by `save`; callers persist it
    pub fn metadata(&self) -> &TrackingConfig {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut TrackingConfig {
        &mut self.metadata
    }

    /// Tracking is enabled, has a worker URL, and a usable key ring
    pub fn is_configured(&self) -> bool {
        self.metadata.enabled && !self.metadata.worker_url.trim().is_empty() && self.load().is_ok()
    }

    /// Assemble the key ring from metadata and, when needed, the secret store
    ///
    /// A current-version pointer in the secret store overrides the metadata.
    /// Version 1 falls back to the unversioned legacy slot.
    pub fn load(&self) -> Result<KeyRing> {
        let mut metadata = self.metadata.clone();
        metadata.normalize();

        let mut current = validate_key_version(metadata.tracking_key_current_version)?;
        let mut versions: BTreeSet<KeyVersion> = metadata
            .tracking_key_versions
            .iter()
            .map(|v| validate_key_version(*v))
            .collect::<Result<_>>()?;
        let mut keys = KeySet::new();
        let mut admin_key = metadata.admin_key.trim().to_string();

        if !metadata.needs_secret_store() {
            keys.insert(current, parse_key(current, &metadata.tracking_key)?);
            return KeyRing::new(current, keys, admin_key);
        }

        if let Some(pointer) = self.secrets.get(CURRENT_VERSION_SECRET)? {
            if let Ok(parsed) = pointer.trim().parse::<i64>() {
                // Unset or non-positive pointers mean the first version
                let parsed = validate_key_version(parsed.max(1))?;
                if parsed != current {
                    debug!(metadata = %current, store = %parsed, "secret store current version wins");
                    current = parsed;
                }
            }
        }
        versions.insert(current);

        for version in &versions {
            if let Some(text) = self.secrets.get(&tracking_key_name(*version))? {
                if !text.trim().is_empty() {
                    keys.insert(*version, parse_key(*version, &text)?);
                }
            }
        }

        if versions.contains(&KeyVersion::INITIAL) && !keys.contains_key(&KeyVersion::INITIAL) {
            if let Some(text) = self.secrets.get(LEGACY_TRACKING_KEY_SECRET)? {
                if !text.trim().is_empty() {
                    keys.insert(KeyVersion::INITIAL, parse_key(KeyVersion::INITIAL, &text)?);
                }
            }
        }

        if !keys.contains_key(&current) && !metadata.tracking_key.trim().is_empty() {
            keys.insert(current, parse_key(current, &metadata.tracking_key)?);
        }

        if admin_key.is_empty() {
            admin_key = self
                .secrets
                .get(ADMIN_KEY_SECRET)?
                .map(|k| k.trim().to_string())
                .unwrap_or_default();
        }

        KeyRing::new(current, keys, admin_key)
    }

    /// Persist keys, the admin secret and the current-version pointer
    ///
    /// Every argument is validated before the first write.
    pub fn save(
        &mut self,
        keys: &BTreeMap<KeyVersion, String>,
        admin_key: &str,
        new_current_version: i64,
    ) -> Result<()> {
        if admin_key.trim().is_empty() {
            return Err(TrackingError::Validation("missing admin key".to_string()));
        }
        let current = validate_key_version(new_current_version)?;
        match keys.get(&current) {
            Some(key) if !key.trim().is_empty() => {}
            _ => {
                return Err(TrackingError::Validation(format!(
                    "missing tracking key for version {}",
                    current
                )))
            }
        }

        let retained: Vec<(KeyVersion, &str)> = keys
            .iter()
            .filter(|(_, key)| !key.trim().is_empty())
            .map(|(version, key)| (*version, key.trim()))
            .collect();
        for (version, key) in &retained {
            parse_key(*version, key)?;
        }

        for (version, key) in &retained {
            self.secrets.set(&tracking_key_name(*version), key)?;
            if *version == KeyVersion::INITIAL {
                self.secrets.set(LEGACY_TRACKING_KEY_SECRET, key)?;
            }
        }
        self.secrets.set(ADMIN_KEY_SECRET, admin_key.trim())?;
        self.secrets
            .set(CURRENT_VERSION_SECRET, &current.to_string())?;

        self.metadata.secrets_in_keyring = true;
        self.metadata.tracking_key.clear();
        self.metadata.admin_key.clear();
        self.metadata.tracking_key_current_version = current.into();
        self.metadata.tracking_key_versions = retained.iter().map(|(v, _)| i64::from(*v)).collect();
        self.metadata.normalize();

        info!(
            current_version = %current,
            retained = retained.len(),
            "tracking keys saved"
        );
        Ok(())
    }

    /// Add version N+1 with a fresh key and make it current
    pub fn rotate(&mut self) -> Result<RotationReport> {
        let ring = self.load()?;
        let highest = self
            .metadata
            .tracking_key_versions
            .iter()
            .copied()
            .chain(ring.versions().into_iter().map(i64::from))
            .chain(std::iter::once(i64::from(ring.current_version())))
            .max()
            .unwrap_or(1);
        let next = validate_key_version(highest + 1)?;

        let mut keys: BTreeMap<KeyVersion, String> = ring
            .codec_keys()
            .iter()
            .map(|(version, key)| (*version, key.to_base64()))
            .collect();
        keys.insert(next, TrackingKey::generate().to_base64());

        self.save(&keys, ring.admin_key(), next.into())?;

        Ok(RotationReport {
            previous_version: ring.current_version(),
            current_version: next,
            retained_versions: keys.keys().copied().collect(),
        })
    }

    /// Create the version 1 ring with a fresh key and admin secret
    ///
    /// Refuses to overwrite an existing ring unless `force` is set.
    pub fn setup(&mut self, worker_url: &str, force: bool) -> Result<KeyRing> {
        if !force && self.load().is_ok() {
            return Err(TrackingError::Validation(
                "tracking already configured; rotate instead or pass force".to_string(),
            ));
        }
        if worker_url.trim().is_empty() {
            return Err(TrackingError::Validation("missing worker url".to_string()));
        }

        let mut keys = BTreeMap::new();
        keys.insert(KeyVersion::INITIAL, TrackingKey::generate().to_base64());
        self.metadata.tracking_key_versions.clear();
        self.save(&keys, &generate_admin_key(), KeyVersion::INITIAL.into())?;
        self.metadata.enabled = true;
        self.metadata.worker_url = worker_url.trim().trim_end_matches('/').to_string();
        self.load()
    }
}

fn parse_key(version: KeyVersion, text: &str) -> Result<TrackingKey> {
    TrackingKey::from_base64(text)
        .map_err(|e| TrackingError::Validation(format!("tracking key v{}: {}", version, e)))
}

/// Random 256-bit admin bearer token, URL-safe text
pub fn generate_admin_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decrypt, encrypt, TrackingPayload};

    fn store() -> (KeyStore, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = KeyStore::new(TrackingConfig::default(), secrets.clone());
        (store, secrets)
    }

    fn v(version: i64) -> KeyVersion {
        KeyVersion::new(version).unwrap()
    }

    #[test]
    fn test_setup_creates_version_one() -> Result<()> {
        let (mut store, secrets) = store();
        let ring = store.setup("https://track.example.com/", false)?;

        assert_eq!(ring.current_version(), KeyVersion::INITIAL);
        assert!(!ring.admin_key().is_empty());
        assert_eq!(store.metadata().worker_url, "https://track.example.com");
        assert!(store.is_configured());
        let legacy = secrets.get(LEGACY_TRACKING_KEY_SECRET)?;
        assert!(legacy.is_some());
        assert_eq!(legacy, secrets.get("tracking_key_v1")?);
        assert!(store.setup("https://track.example.com", false).is_err());
        Ok(())
    }

    #[test]
    fn test_save_validation() {
        let (mut store, secrets) = store();
        let mut keys = BTreeMap::new();
        keys.insert(v(1), TrackingKey::generate().to_base64());

        assert!(matches!(
            store.save(&keys, "", 1),
            Err(TrackingError::Validation(_))
        ));
        assert!(matches!(
            store.save(&keys, "admin", 0),
            Err(TrackingError::Validation(_))
        ));
        assert!(matches!(
            store.save(&keys, "admin", 256),
            Err(TrackingError::Validation(_))
        ));
        assert!(matches!(
            store.save(&keys, "admin", 2),
            Err(TrackingError::Validation(_))
        ));

        keys.insert(v(2), "   ".to_string());
        assert!(matches!(
            store.save(&keys, "admin", 2),
            Err(TrackingError::Validation(_))
        ));

        keys.insert(v(3), "not a key".to_string());
        assert!(matches!(
            store.save(&keys, "admin", 1),
            Err(TrackingError::Validation(_))
        ));
        // Nothing was written by any failed save
        assert_eq!(secrets.get(ADMIN_KEY_SECRET).unwrap(), None);
    }

    #[test]
    fn test_save_skips_empty_keys() -> Result<()> {
        let (mut store, secrets) = store();
        let mut keys = BTreeMap::new();
        keys.insert(v(1), String::new());
        keys.insert(v(2), TrackingKey::generate().to_base64());
        store.save(&keys, "admin", 2)?;

        assert_eq!(secrets.get("tracking_key_v1")?, None);
        assert_eq!(secrets.get(LEGACY_TRACKING_KEY_SECRET)?, None);
        assert_eq!(secrets.get(CURRENT_VERSION_SECRET)?.as_deref(), Some("2"));
        assert_eq!(store.metadata().tracking_key_versions, vec![2]);
        Ok(())
    }

    #[test]
    fn test_rotate_retains_history() -> Result<()> {
        let (mut store, _) = store();
        let first = store.setup("https://track.example.com", false)?;
        let payload = TrackingPayload::new("a@example.com", "deadbeef", 1_700_000_000);
        let old_blob = encrypt(&payload, first.current_key().as_slice(), first.current_version())?;

        let r1 = store.rotate()?;
        assert_eq!(r1.previous_version, v(1));
        assert_eq!(r1.current_version, v(2));
        let r2 = store.rotate()?;
        assert_eq!(r2.current_version, v(3));
        assert_eq!(r2.retained_versions, vec![v(1), v(2), v(3)]);

        let ring = store.load()?;
        assert_eq!(ring.current_version(), v(3));
        assert_eq!(ring.versions(), vec![v(1), v(2), v(3)]);
        assert_eq!(ring.admin_key(), first.admin_key());
        assert_eq!(ring.codec_keys()[&v(1)], *first.current_key());
        assert_eq!(decrypt(&old_blob, ring.codec_keys(), None)?, payload);
        Ok(())
    }

    #[test]
    fn test_rotate_uses_highest_known_version() -> Result<()> {
        let (mut store, _) = store();
        let mut keys = BTreeMap::new();
        keys.insert(v(1), TrackingKey::generate().to_base64());
        keys.insert(v(5), TrackingKey::generate().to_base64());
        store.save(&keys, "admin", 1)?;

        let report = store.rotate()?;
        assert_eq!(report.current_version, v(6));
        Ok(())
    }

    #[test]
    fn test_rotate_without_ring_fails_closed() {
        let (mut store, secrets) = store();
        assert!(store.rotate().is_err());
        assert_eq!(secrets.get(CURRENT_VERSION_SECRET).unwrap(), None);
    }

    #[test]
    fn test_load_inline_secrets() -> Result<()> {
        let key = TrackingKey::generate();
        let metadata = TrackingConfig {
            enabled: true,
            worker_url: "https://track.example.com".into(),
            tracking_key: key.to_base64(),
            admin_key: "inline-admin".into(),
            ..Default::default()
        };
        let store = KeyStore::new(metadata, Arc::new(MemorySecretStore::new()));
        let ring = store.load()?;
        assert_eq!(ring.current_key(), &key);
        assert_eq!(ring.admin_key(), "inline-admin");
        Ok(())
    }

    #[test]
    fn test_load_legacy_slot_and_store_pointer() -> Result<()> {
        let secrets = Arc::new(MemorySecretStore::new());
        let legacy = TrackingKey::generate();
        secrets.set(LEGACY_TRACKING_KEY_SECRET, &legacy.to_base64())?;
        secrets.set(ADMIN_KEY_SECRET, "admin")?;

        let store = KeyStore::new(TrackingConfig::default(), secrets.clone());
        let ring = store.load()?;
        assert_eq!(ring.current_version(), KeyVersion::INITIAL);
        assert_eq!(ring.current_key(), &legacy);

        let v4 = TrackingKey::generate();
        secrets.set("tracking_key_v4", &v4.to_base64())?;
        secrets.set(CURRENT_VERSION_SECRET, "4")?;
        let ring = store.load()?;
        assert_eq!(ring.current_version(), v(4));
        assert_eq!(ring.current_key(), &v4);
        assert_eq!(ring.versions(), vec![v(1), v(4)]);
        Ok(())
    }

    #[test]
    fn test_non_positive_store_pointer_means_first_version() -> Result<()> {
        let (mut store, secrets) = store();
        let first = store.setup("https://track.example.com", false)?;

        for pointer in ["0", "-3"] {
            secrets.set(CURRENT_VERSION_SECRET, pointer)?;
            let ring = store.load()?;
            assert_eq!(ring.current_version(), KeyVersion::INITIAL);
            assert_eq!(ring.current_key(), first.current_key());
        }
        assert!(store.is_configured());
        Ok(())
    }

    #[test]
    fn test_file_secret_store_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("secrets.json");
        let secrets = Arc::new(FileSecretStore::new(&path));
        let mut store = KeyStore::new(TrackingConfig::default(), secrets);
        let ring = store.setup("https://track.example.com", false)?;

        let reopened = KeyStore::new(
            store.metadata().clone(),
            Arc::new(FileSecretStore::new(&path)),
        );
        let loaded = reopened.load()?;
        assert_eq!(loaded.current_key(), ring.current_key());
        assert_eq!(loaded.admin_key(), ring.admin_key());
        Ok(())
    }
}
