//! Credential encryption
//!
//! - [`keyring`]: resolves the named AES-256 keys from configuration
//! - [`codec`]: `enc:v2` / `enc:v1` secret envelopes over a keyring
//! - [`rotation`]: re-encrypts stored credentials under the active key

pub mod codec;
pub mod keyring;
pub mod rotation;

pub use codec::{decrypt, encrypt, envelope_key_id, is_encrypted, SecretCodec};
pub use keyring::{KeyEntry, Keyring, DEFAULT_KEY_ID, KEY_SIZE};
pub use rotation::{rotate_credentials, RotationReport};
