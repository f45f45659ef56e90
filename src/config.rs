//! Tracking configuration file
//!
//! Plaintext metadata lives in a JSON file next to (or instead of) the secret
//! store. When `secrets_in_keyring` is set the inline secrets are blanked on
//! save and pulled from the [`SecretStore`](crate::keystore::SecretStore) on load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TrackingError};

/// Environment variable consulted when no explicit config path is given
pub const CONFIG_ENV_VAR: &str = "PIXELTRACK_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "pixeltrack.json";

const DEFAULT_TRACKING_KEY_VERSION: i64 = 1;

/// Persisted tracking metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub worker_url: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub secrets_in_keyring: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracking_key_versions: Vec<i64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tracking_key_current_version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tracking_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_key: String,
    #[serde(default)]
    pub service: ServiceSettings,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Tunables for the ingestion and query services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: u64,
    #[serde(default = "default_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_admin_list_max")]
    pub admin_list_max: usize,
}

fn default_rate_limit_threshold() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    3600
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_admin_list_max() -> usize {
    500
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            rate_limit_threshold: default_rate_limit_threshold(),
            rate_window_secs: default_window_secs(),
            dedup_window_secs: default_window_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            admin_list_max: default_admin_list_max(),
        }
    }
}

impl ServiceSettings {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Pick the config path: explicit argument, then `PIXELTRACK_CONFIG`, then the default file
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

impl TrackingConfig {
    /// Load and normalize; a missing file yields a disabled default
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no tracking config, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut cfg: TrackingConfig = serde_json::from_str(&data)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Write to `path`, blanking inline secrets when they live in the secret store
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let mut to_save = self.clone();
        if to_save.secrets_in_keyring {
            to_save.tracking_key.clear();
            to_save.admin_key.clear();
        }

        let data = serde_json::to_vec_pretty(&to_save)?;
        write_private(path, &data)
    }

    /// Current version defaults to 1; versions are sorted, de-duplicated and
    /// always contain the current version
    pub fn normalize(&mut self) {
        if self.tracking_key_current_version <= 0 {
            self.tracking_key_current_version = DEFAULT_TRACKING_KEY_VERSION;
        }
        self.tracking_key_versions = sorted_versions(
            self.tracking_key_versions
                .iter()
                .copied()
                .chain(std::iter::once(self.tracking_key_current_version)),
        );
    }

    /// Secrets must come from the secret store when flagged or absent inline
    pub fn needs_secret_store(&self) -> bool {
        self.secrets_in_keyring
            || self.tracking_key.trim().is_empty()
            || self.admin_key.trim().is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.worker_url.trim().is_empty() {
            return Err(TrackingError::Validation(
                "tracking enabled without worker_url".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sorted, de-duplicated, positive versions
pub fn sorted_versions(versions: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut out: Vec<i64> = versions.into_iter().filter(|v| *v > 0).collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
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
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    Ok(())
}
