//! Re-encryption of stored credentials under the active key

use tracing::{info, warn};

use crate::database::ProviderStore;
use crate::error::{AppError, CryptoError};
use crate::models::{CredentialUpdate, ProviderCredential};

use super::SecretCodec;

/// Result of a rotation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Providers inspected
    pub scanned: usize,
    /// Providers with at least one field re-encrypted (or that would be, on a dry run)
    pub rotated: usize,
    /// Providers skipped because a field could not be decrypted
    pub failed: Vec<String>,
    /// Providers whose credentials changed while being rotated; a later pass picks them up
    pub conflicted: Vec<String>,
}

/// Re-encrypt every credential field not already under the active key
///
/// With `dry_run` nothing is written. Providers whose secrets cannot be
/// decrypted with the current keyring are reported and left untouched.
/// Each write only applies if the row still holds the values that were
/// re-encrypted, so a token refresh racing the pass is never overwritten.
pub async fn rotate_credentials(
    store: &dyn ProviderStore,
    codec: &SecretCodec,
    dry_run: bool,
) -> Result<RotationReport, AppError> {
    let providers = store.list_providers().await?;
    let mut report = RotationReport {
        scanned: providers.len(),
        ..Default::default()
    };

    for provider in providers {
        let update = match rotation_update(codec, &provider) {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(e) => {
                warn!(provider_id = %provider.id, error = %e, "Cannot re-encrypt provider credentials");
                report.failed.push(provider.id);
                continue;
            }
        };

        if !dry_run
            && !store
                .replace_credentials(&provider.id, &provider.secret_fields(), &update)
                .await?
        {
            warn!(provider_id = %provider.id, "Credentials changed during rotation, skipped");
            report.conflicted.push(provider.id);
            continue;
        }

        info!(provider_id = %provider.id, dry_run, "Provider credentials re-encrypted");
        report.rotated += 1;
    }

    Ok(report)
}

fn rotation_update(
    codec: &SecretCodec,
    provider: &ProviderCredential,
) -> Result<Option<CredentialUpdate>, CryptoError> {
    let rotate = |value: Option<&str>| -> Result<Option<String>, CryptoError> {
        match value.filter(|v| !v.is_empty()) {
            Some(v) if codec.needs_rotation(v) => codec.reencrypt(v).map(Some),
            _ => Ok(None),
        }
    };

    let update = CredentialUpdate {
        access_token_enc: rotate(provider.access_token_enc.as_deref())?,
        refresh_token_enc: rotate(provider.refresh_token_enc.as_deref())?,
        password_enc: rotate(provider.password_enc.as_deref())?,
        token_expires_at: None,
    };

    let changed = update.access_token_enc.is_some()
        || update.refresh_token_enc.is_some()
        || update.password_enc.is_some();
    Ok(changed.then_some(update))
}
