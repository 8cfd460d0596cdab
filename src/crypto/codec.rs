//! Secret envelope codec
//!
//! Encrypts secrets with AES-256-GCM under the keyring's active key and
//! formats them as `enc:v2:<keyId>:<iv>:<tag>:<ciphertext>` (base64url, no
//! padding). Decryption understands the current format, the legacy
//! `enc:v1:<iv>:<tag>:<ciphertext>` format, and passes any other string
//! through unchanged so historical plaintext rows keep working.

use std::sync::Arc;

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce, Tag,
};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use tracing::debug;

use super::keyring::{KeyEntry, Keyring};
use crate::error::CryptoError;

/// Prefix of the legacy single-key format
pub const V1_PREFIX: &str = "enc:v1:";

/// Prefix of the current key-id format
pub const V2_PREFIX: &str = "enc:v2:";

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM
const TAG_SIZE: usize = 16;

/// base64url; unpadded on encode, padding optional on decode
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encrypts and decrypts secrets against a shared keyring
#[derive(Debug, Clone)]
pub struct SecretCodec {
    keyring: Arc<Keyring>,
}

impl SecretCodec {
    /// Create a codec over the given keyring
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self { keyring }
    }

    /// The keyring this codec uses
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Encrypt a secret under the active key
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        encrypt(plaintext, &self.keyring)
    }

    /// Decrypt an envelope, or return non-envelope input unchanged
    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        decrypt(value, &self.keyring)
    }

    /// Decrypt an optional stored field
    pub fn decrypt_opt(&self, value: Option<&str>) -> Result<Option<String>, CryptoError> {
        value.map(|v| self.decrypt(v)).transpose()
    }

    /// Whether a stored value should be rewritten under the active key
    ///
    /// True for plaintext, legacy `v1` envelopes, and `v2` envelopes written
    /// under any key other than the active one.
    pub fn needs_rotation(&self, value: &str) -> bool {
        match envelope_key_id(value) {
            Some(key_id) => key_id != self.keyring.active_key_id(),
            None => true,
        }
    }

    /// Decrypt and re-encrypt a stored value under the active key
    pub fn reencrypt(&self, value: &str) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(value)?;
        self.encrypt(&plaintext)
    }
}

/// Whether a value carries a recognized envelope prefix
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(V1_PREFIX) || value.starts_with(V2_PREFIX)
}

/// Key id embedded in a `v2` envelope
pub fn envelope_key_id(value: &str) -> Option<&str> {
    value
        .strip_prefix(V2_PREFIX)
        .and_then(|rest| rest.split(':').next())
}

/// Encrypt `plaintext` under the keyring's active key
///
/// Every call draws a fresh nonce, so identical plaintexts never produce
/// identical envelopes.
pub fn encrypt(plaintext: &str, keyring: &Keyring) -> Result<String, CryptoError> {
    let active = keyring.active_key();
    let cipher = cipher_for(active);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, b"", &mut buffer)
        .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

    Ok(format!(
        "{}{}:{}:{}:{}",
        V2_PREFIX,
        active.id(),
        B64.encode(nonce),
        B64.encode(tag),
        B64.encode(&buffer)
    ))
}

/// Decrypt an envelope produced by [`encrypt`] or by the legacy format
pub fn decrypt(value: &str, keyring: &Keyring) -> Result<String, CryptoError> {
    let (sealed, candidates) = if let Some(rest) = value.strip_prefix(V2_PREFIX) {
        let (key_id, sealed) = parse_v2(rest)?;
        (sealed, v2_candidates(key_id, keyring))
    } else if let Some(rest) = value.strip_prefix(V1_PREFIX) {
        (parse_sealed(rest)?, keyring.keys().iter().collect())
    } else {
        return Ok(value.to_string());
    };

    match first_success(candidates, &sealed) {
        DecryptOutcome::Decrypted { key_id, plaintext } => {
            debug!(key_id = %key_id, "Secret decrypted");
            String::from_utf8(plaintext).map_err(|_| {
                CryptoError::Decryption("decrypted secret is not valid UTF-8".to_string())
            })
        }
        DecryptOutcome::Exhausted { tried } => Err(CryptoError::Decryption(format!(
            "no configured key authenticated the ciphertext ({} tried)",
            tried
        ))),
    }
}

/// Result of trying candidate keys in order
#[derive(Debug, PartialEq, Eq)]
enum DecryptOutcome {
    /// A candidate authenticated the ciphertext
    Decrypted { key_id: String, plaintext: Vec<u8> },
    /// Every candidate failed
    Exhausted { tried: usize },
}

/// Try each candidate in order; the first key that authenticates wins
fn first_success(candidates: Vec<&KeyEntry>, sealed: &Sealed) -> DecryptOutcome {
    let tried = candidates.len();
    candidates
        .into_iter()
        .find_map(|entry| {
            open(entry, sealed).map(|plaintext| DecryptOutcome::Decrypted {
                key_id: entry.id().to_string(),
                plaintext,
            })
        })
        .unwrap_or(DecryptOutcome::Exhausted { tried })
}

/// Embedded key first, then the active key, then every other key
fn v2_candidates<'k>(key_id: &str, keyring: &'k Keyring) -> Vec<&'k KeyEntry> {
    let mut candidates: Vec<&KeyEntry> = Vec::with_capacity(keyring.len());
    let preferred = keyring
        .get(key_id)
        .into_iter()
        .chain(std::iter::once(keyring.active_key()))
        .chain(keyring.keys().iter());
    for entry in preferred {
        if !candidates.iter().any(|c| c.id() == entry.id()) {
            candidates.push(entry);
        }
    }
    candidates
}

/// Decoded envelope fields
#[derive(Debug)]
struct Sealed {
    iv: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn parse_v2(rest: &str) -> Result<(&str, Sealed), CryptoError> {
    let (key_id, sealed) = rest
        .split_once(':')
        .ok_or_else(|| malformed("missing key id"))?;
    if key_id.is_empty() {
        return Err(malformed("empty key id"));
    }
    Ok((key_id, parse_sealed(sealed)?))
}

fn parse_sealed(fields: &str) -> Result<Sealed, CryptoError> {
    let parts: Vec<&str> = fields.split(':').collect();
    let [iv, tag, ciphertext] = parts.as_slice() else {
        return Err(malformed("expected iv:tag:ciphertext"));
    };

    let sealed = Sealed {
        iv: decode_field(iv, "iv")?,
        tag: decode_field(tag, "tag")?,
        ciphertext: decode_field(ciphertext, "ciphertext")?,
    };

    if sealed.iv.len() != NONCE_SIZE {
        return Err(malformed("iv must be 12 bytes"));
    }
    if sealed.tag.len() != TAG_SIZE {
        return Err(malformed("tag must be 16 bytes"));
    }
    Ok(sealed)
}

fn decode_field(field: &str, name: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(field)
        .map_err(|_| CryptoError::Decryption(format!("invalid base64url in {}", name)))
}

fn malformed(detail: &str) -> CryptoError {
    CryptoError::Decryption(format!("malformed secret envelope: {}", detail))
}

fn cipher_for(entry: &KeyEntry) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(entry.key()))
}

/// Authenticate and decrypt with one key; `None` on tag mismatch
fn open(entry: &KeyEntry, sealed: &Sealed) -> Option<Vec<u8>> {
    let mut buffer = sealed.ciphertext.clone();
    cipher_for(entry)
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.iv),
            b"",
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .ok()
        .map(|_| buffer)
}
