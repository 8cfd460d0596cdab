//! Keyring resolution
//!
//! Builds the immutable set of named AES-256 keys used by the secret codec,
//! plus the id of the key used for new encryptions. Resolution order:
//!
//! 1. `encryption.keys` (`keyId:keyMaterial,...`)
//! 2. `encryption.legacy_key` under the implicit id `"default"`
//! 3. a fixed development key, refused in production

use tracing::{debug, warn};

use crate::config::{EncryptionConfig, Environment};
use crate::error::CryptoError;

/// Key size for AES-256 (bytes)
pub const KEY_SIZE: usize = 32;

/// Id used for the single legacy key and the development key
pub const DEFAULT_KEY_ID: &str = "default";

/// Development-only key material; unreachable in production
const DEV_KEY_MATERIAL: &str = "mailbridge-dev-only-insecure-key!";

/// A named 256-bit key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyEntry {
    id: String,
    key: [u8; KEY_SIZE],
}

impl KeyEntry {
    /// Key id as written into `enc:v2` envelopes
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Immutable set of trusted keys plus the active key id
///
/// Keys keep their configuration order, which is the order legacy
/// ciphertext is tried in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    active_key_id: String,
    active_index: usize,
    keys: Vec<KeyEntry>,
}

impl Keyring {
    /// Resolve the keyring from configuration
    pub fn resolve(
        config: &EncryptionConfig,
        environment: Environment,
    ) -> Result<Self, CryptoError> {
        let mut pairs = parse_key_list(config.keys.as_deref().unwrap_or(""))?;

        if pairs.is_empty() {
            if let Some(legacy) = non_empty(config.legacy_key.as_deref()) {
                debug!("Using legacy single encryption key");
                pairs.push((DEFAULT_KEY_ID.to_string(), legacy.to_string()));
            }
        }

        if pairs.is_empty() {
            if environment.is_production() {
                return Err(CryptoError::Configuration(
                    "no encryption keys configured".to_string(),
                ));
            }
            warn!("No encryption keys configured, using the development key");
            pairs.push((DEFAULT_KEY_ID.to_string(), DEV_KEY_MATERIAL.to_string()));
        }

        let active = non_empty(config.active_key_id.as_deref())
            .map(str::to_string)
            .or_else(|| pairs.first().map(|(id, _)| id.clone()))
            .unwrap_or_else(|| DEFAULT_KEY_ID.to_string());

        let keyring = Self::from_material(&active, &pairs)?;
        debug!(
            active_key_id = %keyring.active_key_id,
            keys = keyring.keys.len(),
            "Keyring resolved"
        );
        Ok(keyring)
    }

    /// Build a keyring from `(id, material)` pairs
    pub fn from_material<S: AsRef<str>>(
        active_key_id: &str,
        pairs: &[(S, S)],
    ) -> Result<Self, CryptoError> {
        let mut keys: Vec<KeyEntry> = Vec::with_capacity(pairs.len());
        for (id, material) in pairs {
            let id = id.as_ref();
            if keys.iter().any(|k| k.id == id) {
                return Err(CryptoError::Configuration(format!(
                    "duplicate encryption key id: {}",
                    id
                )));
            }
            keys.push(KeyEntry {
                id: id.to_string(),
                key: derive_key(id, material.as_ref())?,
            });
        }

        let active_index = keys
            .iter()
            .position(|k| k.id == active_key_id)
            .ok_or_else(|| {
                CryptoError::Configuration(format!(
                    "active encryption key id {:?} is not in the keyring",
                    active_key_id
                ))
            })?;

        Ok(Self {
            active_key_id: active_key_id.to_string(),
            active_index,
            keys,
        })
    }

    /// Id of the key used for new encryptions
    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    /// The key used for new encryptions
    pub fn active_key(&self) -> &KeyEntry {
        &self.keys[self.active_index]
    }

    /// Look up a key by id
    pub fn get(&self, key_id: &str) -> Option<&KeyEntry> {
        self.keys.iter().find(|k| k.id == key_id)
    }

    /// All keys in configuration order
    pub fn keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    /// Number of configured keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false for a constructed keyring
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Truncate key material to 32 bytes; shorter material is rejected
fn derive_key(id: &str, material: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let bytes = material.as_bytes();
    if bytes.len() < KEY_SIZE {
        return Err(CryptoError::Configuration(format!(
            "encryption key {:?} must be at least {} bytes, got {}",
            id,
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes[..KEY_SIZE]);
    Ok(key)
}

/// Parse `keyId:keyMaterial` pairs separated by commas
fn parse_key_list(raw: &str) -> Result<Vec<(String, String)>, CryptoError> {
    let mut pairs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, material) = entry.split_once(':').ok_or_else(|| {
            CryptoError::Configuration(format!(
                "encryption key entry must be keyId:keyMaterial, got an entry of {} chars",
                entry.len()
            ))
        })?;
        let (id, material) = (id.trim(), material.trim());
        if id.is_empty() || material.is_empty() {
            return Err(CryptoError::Configuration(
                "encryption key entry has an empty id or material".to_string(),
            ));
        }
        pairs.push((id.to_string(), material.to_string()));
    }
    Ok(pairs)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
