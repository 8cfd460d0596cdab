//! OAuth access token refresh
//!
//! [`TokenRefresher`] hands the sync loop a usable credential for a
//! provider record: it decrypts the stored tokens, refreshes them through a
//! [`TokenExchanger`] when they are about to expire, and writes the
//! re-encrypted result back to the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{OAuthConfig, OAuthProviderConfig};
use crate::crypto::SecretCodec;
use crate::database::ProviderStore;
use crate::error::SyncError;
use crate::models::{CredentialUpdate, ProviderCredential, ProviderType};

/// Access tokens expiring within this many minutes are refreshed before use
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Assumed lifetime of a refreshed token when the endpoint omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_MINUTES: i64 = 60;

/// OAuth errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OAuthError {
    #[error("OAuth configuration error: {0}")]
    Configuration(String),

    #[error("OAuth request failed: {0}")]
    Request(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<OAuthError> for SyncError {
    fn from(err: OAuthError) -> Self {
        SyncError::TokenRefresh(err.to_string())
    }
}

/// Tokens returned by a refresh exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    /// New access token
    pub access_token: String,
    /// New refresh token, or the previous one if the provider sent none
    pub refresh_token: Option<String>,
    /// Access token expiry
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Exchanges a refresh token at a provider's token endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Trade `refresh_token` for a new access token
    async fn refresh(
        &self,
        provider_type: ProviderType,
        refresh_token: &str,
    ) -> Result<OAuthTokens, OAuthError>;
}

/// [`TokenExchanger`] over the standard `refresh_token` grant
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    providers: HashMap<ProviderType, OAuthProviderConfig>,
}

impl HttpTokenExchanger {
    /// Create an exchanger for the configured providers
    pub fn new(config: &OAuthConfig) -> Result<Self, OAuthError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| OAuthError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            providers: config.providers.clone(),
        })
    }

    fn provider_config(&self, provider_type: ProviderType) -> Result<&OAuthProviderConfig, OAuthError> {
        self.providers
            .get(&provider_type)
            .filter(|c| !c.token_url.is_empty())
            .ok_or_else(|| {
                OAuthError::Configuration(format!(
                    "no OAuth token endpoint configured for {}",
                    provider_type
                ))
            })
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn refresh(
        &self,
        provider_type: ProviderType,
        refresh_token: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let config = self.provider_config(provider_type)?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
        ];
        if let Some(secret) = &config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!(provider_type = %provider_type, "Refreshing access token");

        let response = self
            .client
            .post(&config.token_url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(
                provider_type = %provider_type,
                status = status.as_u16(),
                "Token refresh rejected"
            );
            return Err(OAuthError::RefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?;

        let expires_at = token_response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        // Some providers don't return a new refresh token
        let refresh_token = token_response
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(OAuthTokens {
            access_token: token_response.access_token,
            refresh_token: Some(refresh_token),
            expires_at,
        })
    }
}

/// A decrypted credential ready for a provider session
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth bearer token (Gmail, Outlook)
    AccessToken(String),
    /// SMTP password
    Password(String),
}

impl Credential {
    /// The secret value
    pub fn secret(&self) -> &str {
        match self {
            Credential::AccessToken(s) | Credential::Password(s) => s,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::AccessToken(_) => write!(f, "AccessToken(<redacted>)"),
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
        }
    }
}

/// Keeps provider access tokens fresh
#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<dyn ProviderStore>,
    codec: SecretCodec,
    exchanger: Arc<dyn TokenExchanger>,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn ProviderStore>,
        codec: SecretCodec,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        Self {
            store,
            codec,
            exchanger,
        }
    }

    /// The credential a sync attempt should authenticate with
    pub async fn resolve_credential(
        &self,
        record: &ProviderCredential,
    ) -> Result<Credential, SyncError> {
        if record.provider_type.uses_oauth() {
            return self
                .ensure_fresh_access_token(record)
                .await
                .map(Credential::AccessToken);
        }

        match self.decrypt_non_empty(record.password_enc.as_deref())? {
            Some(password) => Ok(Credential::Password(password)),
            None => Err(SyncError::MissingCredentials(record.id.clone())),
        }
    }

    /// A usable access token, refreshing it first if it expires within
    /// [`REFRESH_MARGIN_MINUTES`]
    pub async fn ensure_fresh_access_token(
        &self,
        record: &ProviderCredential,
    ) -> Result<String, SyncError> {
        self.ensure_fresh_access_token_at(record, Utc::now()).await
    }

    /// [`ensure_fresh_access_token`](Self::ensure_fresh_access_token) at a given instant
    pub async fn ensure_fresh_access_token_at(
        &self,
        record: &ProviderCredential,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        let access = self.decrypt_non_empty(record.access_token_enc.as_deref())?;
        let refresh = self.decrypt_non_empty(record.refresh_token_enc.as_deref())?;
        let margin = chrono::Duration::minutes(REFRESH_MARGIN_MINUTES);

        let refresh = match (access, refresh) {
            (None, None) => return Err(SyncError::MissingCredentials(record.id.clone())),
            // Nothing to refresh with
            (Some(access), None) => return Ok(access),
            (Some(access), Some(refresh)) => match record.token_expires_at {
                None => return Ok(access),
                Some(expires_at) if expires_at > now + margin => return Ok(access),
                Some(_) => refresh,
            },
            (None, Some(refresh)) => refresh,
        };

        let tokens = self
            .exchanger
            .refresh(record.provider_type, &refresh)
            .await
            .map_err(|e| {
                warn!(
                    provider_id = %record.id,
                    provider_type = %record.provider_type,
                    error = %e,
                    "Access token refresh failed"
                );
                SyncError::from(e)
            })?;

        let refresh_token = tokens.refresh_token.as_deref().unwrap_or(&refresh);
        // The stored expiry is stale once a new token is issued
        let expires_at = tokens
            .expires_at
            .unwrap_or_else(|| now + chrono::Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINUTES));
        let update = CredentialUpdate {
            access_token_enc: Some(self.codec.encrypt(&tokens.access_token)?),
            refresh_token_enc: Some(self.codec.encrypt(refresh_token)?),
            password_enc: None,
            token_expires_at: Some(expires_at),
        };
        self.store.update_credentials(&record.id, &update).await?;

        info!(
            provider_id = %record.id,
            provider_type = %record.provider_type,
            "Access token refreshed"
        );
        Ok(tokens.access_token)
    }

    fn decrypt_non_empty(&self, value: Option<&str>) -> Result<Option<String>, SyncError> {
        Ok(self
            .codec
            .decrypt_opt(value)?
            .filter(|secret| !secret.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keyring;
    use crate::database::{MockProviderStore, SqliteDatabase};
    use crate::error::CryptoError;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn codec() -> SecretCodec {
        SecretCodec::new(Arc::new(Keyring::from_material("k1", &[("k1", KEY)]).unwrap()))
    }

    fn tokens(access: &str, refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: access.to_string(),
            refresh_token: refresh.map(String::from),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }

    fn gmail_record(
        codec: &SecretCodec,
        access: &str,
        refresh: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ProviderCredential {
        ProviderCredential::new("p1", "ws1", ProviderType::Gmail).with_tokens(
            codec.encrypt(access).unwrap(),
            refresh.map(|r| codec.encrypt(r).unwrap()),
            expires_at,
        )
    }

    fn exchanger_config(server: &MockServer) -> OAuthConfig {
        let mut providers = HashMap::new();
        providers.insert(
            ProviderType::Gmail,
            OAuthProviderConfig {
                token_url: format!("{}/token", server.uri()),
                client_id: "client-123".to_string(),
                client_secret: Some("shh".to_string()),
                timeout_secs: 5,
            },
        );
        OAuthConfig { providers }
    }

    // =========================================================================
    // HttpTokenExchanger
    // =========================================================================

    #[tokio::test]
    async fn test_http_exchange_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-old"))
            .and(body_string_contains("client_id=client-123"))
            .and(body_string_contains("client_secret=shh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a-new",
                "refresh_token": "r-new",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchanger = HttpTokenExchanger::new(&exchanger_config(&server)).unwrap();
        let tokens = exchanger.refresh(ProviderType::Gmail, "r-old").await.unwrap();

        assert_eq!(tokens.access_token, "a-new");
        assert_eq!(tokens.refresh_token.as_deref(), Some("r-new"));
        let expires = tokens.expires_at.unwrap();
        assert!(expires > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_http_exchange_keeps_old_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a-new",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let exchanger = HttpTokenExchanger::new(&exchanger_config(&server)).unwrap();
        let tokens = exchanger.refresh(ProviderType::Gmail, "r-old").await.unwrap();

        assert_eq!(tokens.refresh_token.as_deref(), Some("r-old"));
    }

    #[tokio::test]
    async fn test_http_exchange_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let exchanger = HttpTokenExchanger::new(&exchanger_config(&server)).unwrap();
        let err = exchanger
            .refresh(ProviderType::Gmail, "r-old")
            .await
            .unwrap_err();

        assert!(matches!(err, OAuthError::RefreshFailed(msg) if msg.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_http_exchange_unconfigured_provider() {
        let exchanger = HttpTokenExchanger::new(&OAuthConfig {
            providers: HashMap::new(),
        })
        .unwrap();

        let err = exchanger
            .refresh(ProviderType::Outlook, "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    // =========================================================================
    // TokenRefresher
    // =========================================================================

    #[tokio::test]
    async fn test_fresh_token_returned_without_exchange() {
        let codec = codec();
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_refresh().times(0);
        let store = MockProviderStore::new();

        let refresher = TokenRefresher::new(Arc::new(store), codec.clone(), Arc::new(exchanger));
        let record = gmail_record(
            &codec,
            "a-current",
            Some("r"),
            Some(Utc::now() + chrono::Duration::minutes(30)),
        );

        let token = refresher.ensure_fresh_access_token(&record).await.unwrap();
        assert_eq!(token, "a-current");
    }

    #[tokio::test]
    async fn test_no_refresh_token_or_expiry_returns_access_token() {
        let codec = codec();
        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_refresh().times(0);
        let refresher = TokenRefresher::new(
            Arc::new(MockProviderStore::new()),
            codec.clone(),
            Arc::new(exchanger),
        );

        let expired = Some(Utc::now() - chrono::Duration::hours(1));
        let record = gmail_record(&codec, "a-only", None, expired);
        assert_eq!(
            refresher.ensure_fresh_access_token(&record).await.unwrap(),
            "a-only"
        );

        let record = gmail_record(&codec, "a-no-expiry", Some("r"), None);
        assert_eq!(
            refresher.ensure_fresh_access_token(&record).await.unwrap(),
            "a-no-expiry"
        );
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let codec = codec();
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());

        // Expires inside the 5 minute margin
        let record = gmail_record(
            &codec,
            "a-old",
            Some("r-old"),
            Some(Utc::now() + chrono::Duration::minutes(4)),
        );
        db.insert_provider(&record).await.unwrap();

        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_refresh()
            .withf(|pt, token| *pt == ProviderType::Gmail && token == "r-old")
            .times(1)
            .returning(|_, _| Ok(tokens("a-new", Some("r-new"))));

        let refresher = TokenRefresher::new(db.clone(), codec.clone(), Arc::new(exchanger));
        let token = refresher.ensure_fresh_access_token(&record).await.unwrap();
        assert_eq!(token, "a-new");

        let stored = db.get_provider("p1").await.unwrap().unwrap();
        let access_enc = stored.access_token_enc.unwrap();
        let refresh_enc = stored.refresh_token_enc.unwrap();
        assert!(access_enc.starts_with("enc:v2:k1:"));
        assert_eq!(codec.decrypt(&access_enc).unwrap(), "a-new");
        assert_eq!(codec.decrypt(&refresh_enc).unwrap(), "r-new");
        assert!(stored.token_expires_at.unwrap() > Utc::now() + chrono::Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_none_returned() {
        let codec = codec();
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let record = gmail_record(
            &codec,
            "a-old",
            Some("r-keep"),
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );
        db.insert_provider(&record).await.unwrap();

        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_refresh()
            .returning(|_, _| Ok(tokens("a-new", None)));

        let refresher = TokenRefresher::new(db.clone(), codec.clone(), Arc::new(exchanger));
        refresher.ensure_fresh_access_token(&record).await.unwrap();

        let stored = db.get_provider("p1").await.unwrap().unwrap();
        assert_eq!(
            codec.decrypt(&stored.refresh_token_enc.unwrap()).unwrap(),
            "r-keep"
        );
    }

    #[tokio::test]
    async fn test_refresh_without_expires_in_replaces_stale_expiry() {
        let codec = codec();
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let now = Utc::now();
        let record = gmail_record(
            &codec,
            "a-old",
            Some("r"),
            Some(now + chrono::Duration::minutes(2)),
        );
        db.insert_provider(&record).await.unwrap();

        let mut exchanger = MockTokenExchanger::new();
        exchanger.expect_refresh().times(1).returning(|_, _| {
            Ok(OAuthTokens {
                access_token: "a-new".to_string(),
                refresh_token: None,
                expires_at: None,
            })
        });

        let refresher = TokenRefresher::new(db.clone(), codec.clone(), Arc::new(exchanger));
        refresher
            .ensure_fresh_access_token_at(&record, now)
            .await
            .unwrap();

        let stored = db.get_provider("p1").await.unwrap().unwrap();
        let expires_at = stored.token_expires_at.unwrap();
        assert!(expires_at > now + chrono::Duration::minutes(59));

        // The persisted row no longer needs a refresh
        let again = refresher
            .ensure_fresh_access_token_at(&stored, now + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(again, "a-new");
    }

    #[tokio::test]
    async fn test_refresh_failure_is_token_refresh_error() {
        let codec = codec();
        let mut exchanger = MockTokenExchanger::new();
        exchanger
            .expect_refresh()
            .returning(|_, _| Err(OAuthError::RefreshFailed("invalid_grant".to_string())));
        let mut store = MockProviderStore::new();
        store.expect_update_credentials().times(0);

        let refresher = TokenRefresher::new(Arc::new(store), codec.clone(), Arc::new(exchanger));
        let record = gmail_record(
            &codec,
            "a-old",
            Some("r-old"),
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );

        let err = refresher.ensure_fresh_access_token(&record).await.unwrap_err();
        assert!(matches!(err, SyncError::TokenRefresh(msg) if msg.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let refresher = TokenRefresher::new(
            Arc::new(MockProviderStore::new()),
            codec(),
            Arc::new(MockTokenExchanger::new()),
        );

        let record = ProviderCredential::new("p1", "ws1", ProviderType::Outlook);
        let err = refresher.ensure_fresh_access_token(&record).await.unwrap_err();
        assert_eq!(err, SyncError::MissingCredentials("p1".to_string()));

        // Empty strings count as missing
        let mut record = ProviderCredential::new("p2", "ws1", ProviderType::Outlook);
        record.access_token_enc = Some(String::new());
        let err = refresher.ensure_fresh_access_token(&record).await.unwrap_err();
        assert_eq!(err, SyncError::MissingCredentials("p2".to_string()));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_tokens_still_work() {
        let refresher = TokenRefresher::new(
            Arc::new(MockProviderStore::new()),
            codec(),
            Arc::new(MockTokenExchanger::new()),
        );

        let record = ProviderCredential::new("p1", "ws1", ProviderType::Gmail)
            .with_tokens("plain-access", None, None);
        assert_eq!(
            refresher.ensure_fresh_access_token(&record).await.unwrap(),
            "plain-access"
        );
    }

    #[tokio::test]
    async fn test_undecryptable_token_is_crypto_error() {
        let refresher = TokenRefresher::new(
            Arc::new(MockProviderStore::new()),
            codec(),
            Arc::new(MockTokenExchanger::new()),
        );

        let record = ProviderCredential::new("p1", "ws1", ProviderType::Gmail)
            .with_tokens("enc:v2:k1:garbage", None, None);
        let err = refresher.ensure_fresh_access_token(&record).await.unwrap_err();
        assert!(matches!(err, SyncError::Crypto(CryptoError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_resolve_credential() {
        let codec = codec();
        let refresher = TokenRefresher::new(
            Arc::new(MockProviderStore::new()),
            codec.clone(),
            Arc::new(MockTokenExchanger::new()),
        );

        let smtp = ProviderCredential::new("s1", "ws1", ProviderType::Smtp)
            .with_password(codec.encrypt("hunter2").unwrap());
        let credential = refresher.resolve_credential(&smtp).await.unwrap();
        assert_eq!(credential, Credential::Password("hunter2".to_string()));
        assert_eq!(format!("{:?}", credential), "Password(<redacted>)");

        let no_password = ProviderCredential::new("s2", "ws1", ProviderType::Smtp);
        assert_eq!(
            refresher.resolve_credential(&no_password).await.unwrap_err(),
            SyncError::MissingCredentials("s2".to_string())
        );

        let gmail = gmail_record(&codec, "a", None, None);
        assert_eq!(
            refresher.resolve_credential(&gmail).await.unwrap(),
            Credential::AccessToken("a".to_string())
        );
    }
}
