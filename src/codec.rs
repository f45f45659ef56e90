//! Pixel payload codec
//!
//! Wire format (versioned):
//! `base64url_nopad([1 byte: key version][12 bytes: nonce][ciphertext + 16 byte tag])`
//!
//! Legacy format omits the version byte:
//! `base64url_nopad([12 bytes: nonce][ciphertext + 16 byte tag])`
//!
//! Decoding runs an ordered list of attempts over `(blob, keyset)`. Each
//! attempt pairs a [`DecodeStrategy`] with the key version it uses, so the
//! priority order is data rather than nested branching.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TrackingError};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const MAX_KEY_VERSION: i64 = 255;

/// Smallest blob accepted by [`decrypt`]
pub const MIN_BLOB_LENGTH: usize = 1 + NONCE_LENGTH + TAG_LENGTH;

/// Key version tag, exactly one byte on the wire and never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct KeyVersion(u8);

impl KeyVersion {
    pub const INITIAL: KeyVersion = KeyVersion(1);

    pub fn new(version: i64) -> Result<Self> {
        validate_key_version(version)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The version after this one; fails once the single wire byte is exhausted
    pub fn next(self) -> Result<Self> {
        validate_key_version(i64::from(self.0) + 1)
    }
}

impl TryFrom<i64> for KeyVersion {
    type Error = TrackingError;

    fn try_from(value: i64) -> Result<Self> {
        validate_key_version(value)
    }
}

impl From<KeyVersion> for i64 {
    fn from(version: KeyVersion) -> i64 {
        i64::from(version.0)
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that a version number fits the single-byte wire slot
pub fn validate_key_version(version: i64) -> Result<KeyVersion> {
    if !(1..=MAX_KEY_VERSION).contains(&version) {
        return Err(TrackingError::Validation(format!(
            "key version {} out of range [1, {}]",
            version, MAX_KEY_VERSION
        )));
    }
    Ok(KeyVersion(version as u8))
}

/// AES-256 tracking key (32 bytes) that zeroizes on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TrackingKey([u8; KEY_LENGTH]);

impl TrackingKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(TrackingError::Crypto(format!(
                "invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(TrackingKey(key))
    }

    /// Fresh 256-bit key from the OS RNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        TrackingKey(key)
    }

    /// Parse the standard (padded) base64 text form used by secret stores
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded.trim())?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrackingKey(..)")
    }
}

/// Generate a new 256-bit key in its base64 text form
pub fn generate_key() -> String {
    TrackingKey::generate().to_base64()
}

/// Keys available to the decoder, by version
pub type KeySet = BTreeMap<KeyVersion, TrackingKey>;

/// Plaintext carried inside a pixel URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingPayload {
    #[serde(rename = "r")]
    pub recipient: String,
    #[serde(rename = "s")]
    pub subject_hash: String,
    #[serde(rename = "t")]
    pub sent_at: i64,
}

impl TrackingPayload {
    pub fn new(recipient: impl Into<String>, subject_hash: impl Into<String>, sent_at: i64) -> Self {
        Self {
            recipient: recipient.into(),
            subject_hash: subject_hash.into(),
            sent_at,
        }
    }
}

/// Encrypt a payload under `key` and tag the blob with `version`
pub fn encrypt(payload: &TrackingPayload, key: &[u8], version: KeyVersion) -> Result<String> {
    let sealed = seal(payload, key)?;
    let mut result = Vec::with_capacity(1 + sealed.len());
    result.push(version.get());
    result.extend_from_slice(&sealed);
    Ok(URL_SAFE_NO_PAD.encode(result))
}

/// Encrypt using the legacy framing (no version byte)
///
/// Only the decoder's compatibility path reads this format; new pixels are
/// always produced by [`encrypt`].
pub fn encrypt_legacy(payload: &TrackingPayload, key: &[u8]) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(seal(payload, key)?))
}

/// Returns `[nonce][ciphertext + tag]`
fn seal(payload: &TrackingPayload, key: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let plaintext = serde_json::to_vec(payload)?;

    let mut iv = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| TrackingError::Crypto("encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_LENGTH {
        return Err(TrackingError::Crypto(format!(
            "invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| TrackingError::Crypto(format!("new cipher: {}", e)))
}

/// How a single decode attempt frames the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Caller-supplied version hint or the blob's own version byte
    VersionDirected,
    /// Remaining known versions, ascending
    AscendingFallback,
    /// No version byte: the whole blob is nonce + ciphertext + tag
    Legacy,
}

/// One planned decode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeAttempt {
    pub strategy: DecodeStrategy,
    pub version: KeyVersion,
}

/// Build the ordered attempt list for `raw` against `keys`
///
/// Versioned candidates are de-duplicated: the hint (if a key exists for it),
/// then the embedded version byte (if a key exists for it), then every other
/// known version ascending. Legacy attempts follow, one per distinct key.
pub fn plan_attempts(raw: &[u8], keys: &KeySet, hint: Option<KeyVersion>) -> Vec<DecodeAttempt> {
    let mut attempts: Vec<DecodeAttempt> = Vec::with_capacity(keys.len() * 2);
    let push_versioned =
        |attempts: &mut Vec<DecodeAttempt>, strategy: DecodeStrategy, version: KeyVersion| {
            if keys.contains_key(&version) && !attempts.iter().any(|a| a.version == version) {
                attempts.push(DecodeAttempt { strategy, version });
            }
        };

    if let Some(hint) = hint {
        push_versioned(&mut attempts, DecodeStrategy::VersionDirected, hint);
    }
    if let Some(embedded) = raw.first().and_then(|b| KeyVersion::new(i64::from(*b)).ok()) {
        push_versioned(&mut attempts, DecodeStrategy::VersionDirected, embedded);
    }
    for version in keys.keys() {
        push_versioned(&mut attempts, DecodeStrategy::AscendingFallback, *version);
    }

    let mut seen: Vec<&TrackingKey> = Vec::with_capacity(keys.len());
    for (version, key) in keys {
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        attempts.push(DecodeAttempt {
            strategy: DecodeStrategy::Legacy,
            version: *version,
        });
    }
    attempts
}

/// Decrypt a pixel blob with any retained key
///
/// Fails with `Crypto("ciphertext too short")` before trying any key when the
/// decoded blob cannot hold a version byte, nonce and tag. When every attempt
/// fails the error carries the most informative versioned failure and the
/// last legacy failure.
pub fn decrypt(blob: &str, keys: &KeySet, hint: Option<KeyVersion>) -> Result<TrackingPayload> {
    let raw = URL_SAFE_NO_PAD
        .decode(blob.trim())
        .map_err(|e| TrackingError::Crypto(format!("decode blob: {}", e)))?;
    if raw.len() < MIN_BLOB_LENGTH {
        return Err(TrackingError::Crypto("ciphertext too short".to_string()));
    }

    let mut mismatch_error: Option<String> = None;
    let mut versioned_error: Option<String> = None;
    let mut legacy_error: Option<String> = None;

    for attempt in plan_attempts(&raw, keys, hint) {
        let Some(key) = keys.get(&attempt.version) else {
            continue;
        };
        let outcome = match attempt.strategy {
            DecodeStrategy::VersionDirected | DecodeStrategy::AscendingFallback => {
                open_versioned(&raw, key, attempt.version)
            }
            DecodeStrategy::Legacy => open_sealed(&raw, key),
        };
        match outcome {
            Ok(payload) => {
                debug!(
                    strategy = ?attempt.strategy,
                    version = %attempt.version,
                    "pixel blob decrypted"
                );
                return Ok(payload);
            }
            Err(AttemptError::VersionMismatch(msg)) => {
                mismatch_error.get_or_insert(msg);
            }
            Err(AttemptError::Open(msg)) => match attempt.strategy {
                DecodeStrategy::Legacy => legacy_error = Some(msg),
                _ => {
                    versioned_error.get_or_insert(msg);
                }
            },
        }
    }

    Err(TrackingError::DecryptFailed {
        versioned: versioned_error
            .or(mismatch_error)
            .unwrap_or_else(|| "no key available".to_string()),
        legacy: legacy_error.unwrap_or_else(|| "no key available".to_string()),
    })
}

enum AttemptError {
    VersionMismatch(String),
    Open(String),
}

fn open_versioned(
    raw: &[u8],
    key: &TrackingKey,
    version: KeyVersion,
) -> std::result::Result<TrackingPayload, AttemptError> {
    if raw[0] != version.get() {
        return Err(AttemptError::VersionMismatch(format!(
            "key version mismatch: blob v{}, key v{}",
            raw[0], version
        )));
    }
    open_sealed(&raw[1..], key)
}

fn open_sealed(
    sealed: &[u8],
    key: &TrackingKey,
) -> std::result::Result<TrackingPayload, AttemptError> {
    if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(AttemptError::Open("ciphertext too short".to_string()));
    }
    let cipher = cipher_for(key.as_slice()).map_err(|e| AttemptError::Open(e.to_string()))?;
    let (iv, ciphertext) = sealed.split_at(NONCE_LENGTH);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| AttemptError::Open("decrypt: message authentication failed".to_string()))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| AttemptError::Open(format!("unmarshal payload: {}", e)))
}
