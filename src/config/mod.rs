//! Configuration management for mailbridge-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables. The resulting [`Config`] is built
//! once at startup and passed into every component constructor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::models::ProviderType;

/// Lease TTL bounds in milliseconds
pub const MIN_LEASE_TTL_MS: u64 = 60_000;
pub const MAX_LEASE_TTL_MS: u64 = 3_600_000;
pub const DEFAULT_LEASE_TTL_MS: u64 = 540_000;

/// Scheduler bounds
pub const MAX_SYNC_RETRIES: u32 = 5;
pub const MIN_BACKOFF_BASE_MS: u64 = 50;
pub const MAX_BACKOFF_BASE_MS: u64 = 15_000;
pub const MAX_JITTER_MS: u64 = 10_000;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Deployment environment; `None` when not configured
    #[serde(default)]
    pub environment: Option<Environment>,

    /// Keyring configuration
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Sync lease configuration
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Sync scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// OAuth token endpoint configuration
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Provider sync API configuration
    #[serde(default)]
    pub sync_api: SyncApiConfig,

    /// Failure notification configuration
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// The configured environment, falling back to development
    pub fn effective_environment(&self) -> Environment {
        self.environment.unwrap_or_default()
    }

    /// The configured environment, which must be set explicitly
    ///
    /// The scheduler calls this so a deployment that forgot to set it never
    /// runs on the development key.
    pub fn require_environment(&self) -> Result<Environment, ConfigError> {
        self.environment.ok_or_else(|| {
            ConfigError::MissingRequired(
                "environment (set it in the config file or MAILBRIDGE_ENVIRONMENT)".to_string(),
            )
        })
    }

    /// Load configuration from environment variables with prefix MAILBRIDGE_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(env) = std::env::var("MAILBRIDGE_ENVIRONMENT") {
            config.environment = Some(env.parse()?);
        }

        // Keyring
        if let Ok(keys) = std::env::var("MAILBRIDGE_ENCRYPTION_KEYS") {
            config.encryption.keys = Some(keys);
        }
        if let Ok(key) = std::env::var("MAILBRIDGE_ENCRYPTION_KEY") {
            config.encryption.legacy_key = Some(key);
        }
        if let Ok(id) = std::env::var("MAILBRIDGE_ENCRYPTION_ACTIVE_KEY_ID") {
            config.encryption.active_key_id = Some(id);
        }

        // Lease and scheduler
        if let Ok(ttl) = std::env::var("MAILBRIDGE_SYNC_LEASE_TTL_MS") {
            config.lease.ttl_ms = Some(parse_number(&ttl, "MAILBRIDGE_SYNC_LEASE_TTL_MS")?);
        }
        if let Ok(retries) = std::env::var("MAILBRIDGE_SYNC_MAX_RETRIES") {
            config.scheduler.max_retries = parse_number(&retries, "MAILBRIDGE_SYNC_MAX_RETRIES")?;
        }
        if let Ok(base) = std::env::var("MAILBRIDGE_SYNC_BACKOFF_BASE_MS") {
            config.scheduler.backoff_base_ms =
                parse_number(&base, "MAILBRIDGE_SYNC_BACKOFF_BASE_MS")?;
        }
        if let Ok(jitter) = std::env::var("MAILBRIDGE_SYNC_MAX_JITTER_MS") {
            config.scheduler.max_jitter_ms = parse_number(&jitter, "MAILBRIDGE_SYNC_MAX_JITTER_MS")?;
        }
        if let Ok(interval) = std::env::var("MAILBRIDGE_SYNC_INTERVAL_SECS") {
            config.scheduler.interval_secs =
                parse_number(&interval, "MAILBRIDGE_SYNC_INTERVAL_SECS")?;
        }

        // Collaborators
        if let Ok(path) = std::env::var("MAILBRIDGE_DATABASE_PATH") {
            config.database.path = path;
        }
        if let Ok(url) = std::env::var("MAILBRIDGE_SYNC_API_URL") {
            config.sync_api.base_url = Some(url);
        }
        if let Ok(url) = std::env::var("MAILBRIDGE_NOTIFY_WEBHOOK_URL") {
            config.notifications.webhook_url = Some(url);
        }
        for (provider_type, prefix) in [
            (ProviderType::Gmail, "MAILBRIDGE_GMAIL"),
            (ProviderType::Outlook, "MAILBRIDGE_OUTLOOK"),
        ] {
            let entry = config
                .oauth
                .providers
                .entry(provider_type)
                .or_insert_with(|| OAuthProviderConfig::for_provider(provider_type));
            if let Ok(client_id) = std::env::var(format!("{}_CLIENT_ID", prefix)) {
                entry.client_id = client_id;
            }
            if let Ok(secret) = std::env::var(format!("{}_CLIENT_SECRET", prefix)) {
                entry.client_secret = Some(secret);
            }
        }

        if let Ok(level) = std::env::var("MAILBRIDGE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("MAILBRIDGE_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{} must be a number, got {:?}", name, value)))
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; a fixed development key is allowed
    #[default]
    Development,
    /// Test runs
    Test,
    /// Production; keyring configuration is mandatory
    Production,
}

impl Environment {
    /// Whether this environment must refuse the development key fallback
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidValue(format!(
                "Unknown environment: {}",
                other
            ))),
        }
    }
}

/// Keyring configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncryptionConfig {
    /// Comma-separated `keyId:keyMaterial` pairs
    #[serde(default)]
    pub keys: Option<String>,

    /// Single pre-rotation key material, used when `keys` is empty
    #[serde(default)]
    pub legacy_key: Option<String>,

    /// Overrides the key used for new encryptions
    #[serde(default)]
    pub active_key_id: Option<String>,
}

/// Sync lease configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaseConfig {
    /// Lease TTL override in milliseconds
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl LeaseConfig {
    /// TTL override as a duration, if configured
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the pre-attempt jitter in milliseconds
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Interval between sweeps in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Sessions unused for this long are dropped from the pool
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    /// Provider types swept on every tick
    #[serde(default = "default_provider_types")]
    pub provider_types: Vec<ProviderType>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            interval_secs: default_interval_secs(),
            session_idle_secs: default_session_idle_secs(),
            provider_types: default_provider_types(),
        }
    }
}

impl SchedulerConfig {
    /// Retry count clamped to [0, 5]
    pub fn bounded_max_retries(&self) -> u32 {
        self.max_retries.min(MAX_SYNC_RETRIES)
    }

    /// Backoff base clamped to [50, 15000] ms
    pub fn bounded_backoff_base(&self) -> Duration {
        Duration::from_millis(
            self.backoff_base_ms
                .clamp(MIN_BACKOFF_BASE_MS, MAX_BACKOFF_BASE_MS),
        )
    }

    /// Jitter bound clamped to [0, 10000] ms
    pub fn bounded_max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms.min(MAX_JITTER_MS))
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    2000
}

fn default_interval_secs() -> u64 {
    300
}

fn default_session_idle_secs() -> u64 {
    900
}

fn default_provider_types() -> Vec<ProviderType> {
    vec![ProviderType::Gmail, ProviderType::Outlook, ProviderType::Smtp]
}

/// OAuth token endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthConfig {
    /// Per-provider token endpoints
    #[serde(default = "default_oauth_providers")]
    pub providers: HashMap<ProviderType, OAuthProviderConfig>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            providers: default_oauth_providers(),
        }
    }
}

fn default_oauth_providers() -> HashMap<ProviderType, OAuthProviderConfig> {
    [ProviderType::Gmail, ProviderType::Outlook]
        .into_iter()
        .map(|p| (p, OAuthProviderConfig::for_provider(p)))
        .collect()
}

/// Token endpoint for one OAuth provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthProviderConfig {
    /// Token endpoint URL
    pub token_url: String,

    /// OAuth client id
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret (confidential clients)
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl OAuthProviderConfig {
    /// Well-known token endpoint for a provider type
    pub fn for_provider(provider_type: ProviderType) -> Self {
        let token_url = match provider_type {
            ProviderType::Gmail => "https://oauth2.googleapis.com/token",
            ProviderType::Outlook => "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            ProviderType::Smtp => "",
        };
        Self {
            token_url: token_url.to_string(),
            client_id: String::new(),
            client_secret: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

/// Provider sync API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncApiConfig {
    /// Base URL of the sync API; syncing is disabled when unset
    #[serde(default)]
    pub base_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,
}

impl Default for SyncApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_sync_timeout(),
        }
    }
}

fn default_sync_timeout() -> u64 {
    120
}

/// Failure notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    /// Webhook receiving failure notifications; log-only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_notify_timeout() -> u64 {
    10
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/mailbridge.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json`, `pretty` or `plain`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_yaml_config() {
        let yaml = r#"
environment: production

encryption:
  keys: "k1:0123456789abcdef0123456789abcdef,k2:fedcba9876543210fedcba9876543210"
  active_key_id: "k2"

lease:
  ttl_ms: 120000

scheduler:
  max_retries: 4
  backoff_base_ms: 250
  max_jitter_ms: 0
  interval_secs: 60
  provider_types: ["GMAIL"]

oauth:
  providers:
    GMAIL:
      token_url: "http://localhost:9000/token"
      client_id: "client-1"
      client_secret: "shh"

sync_api:
  base_url: "http://sync.internal"

notifications:
  webhook_url: "http://notify.internal/hook"

database:
  path: "/tmp/test.db"

logging:
  level: "debug"
  format: "pretty"
"#;

        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.environment, Some(Environment::Production));
        assert_eq!(config.encryption.active_key_id, Some("k2".to_string()));
        assert!(config.encryption.keys.as_ref().unwrap().starts_with("k1:"));
        assert_eq!(config.lease.ttl(), Some(Duration::from_millis(120_000)));
        assert_eq!(config.scheduler.max_retries, 4);
        assert_eq!(config.scheduler.backoff_base_ms, 250);
        assert_eq!(config.scheduler.max_jitter_ms, 0);
        assert_eq!(config.scheduler.provider_types, vec![ProviderType::Gmail]);

        let gmail = config.oauth.providers.get(&ProviderType::Gmail).unwrap();
        assert_eq!(gmail.token_url, "http://localhost:9000/token");
        assert_eq!(gmail.client_id, "client-1");
        assert_eq!(gmail.timeout_secs, 30);

        assert_eq!(
            config.sync_api.base_url,
            Some("http://sync.internal".to_string())
        );
        assert_eq!(
            config.notifications.webhook_url,
            Some("http://notify.internal/hook".to_string())
        );
        assert_eq!(config.database.path, "/tmp/test.db");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_default_values_applied() {
        let config = Config::from_yaml("{}").unwrap();

        assert_eq!(config.environment, None);
        assert_eq!(config.effective_environment(), Environment::Development);
        assert_eq!(config.encryption, EncryptionConfig::default());
        assert_eq!(config.lease.ttl(), None);
        assert_eq!(config.scheduler.max_retries, 2);
        assert_eq!(config.scheduler.backoff_base_ms, 1000);
        assert_eq!(config.scheduler.max_jitter_ms, 2000);
        assert_eq!(config.scheduler.provider_types.len(), 3);
        assert!(config.oauth.providers.contains_key(&ProviderType::Gmail));
        assert!(config.oauth.providers.contains_key(&ProviderType::Outlook));
        assert_eq!(config.database.path, "/data/db/mailbridge.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_scheduler_bounds_are_clamped() {
        let config = SchedulerConfig {
            max_retries: 9,
            backoff_base_ms: 1,
            max_jitter_ms: 60_000,
            ..Default::default()
        };

        assert_eq!(config.bounded_max_retries(), 5);
        assert_eq!(config.bounded_backoff_base(), Duration::from_millis(50));
        assert_eq!(config.bounded_max_jitter(), Duration::from_millis(10_000));

        let config = SchedulerConfig {
            backoff_base_ms: 100_000,
            ..Default::default()
        };
        assert_eq!(config.bounded_backoff_base(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_MAILBRIDGE_KEYS", "k1:0123456789abcdef0123456789abcdef");

        let yaml = r#"
encryption:
  keys: "${TEST_MAILBRIDGE_KEYS}"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.encryption.keys,
            Some("k1:0123456789abcdef0123456789abcdef".to_string())
        );

        std::env::remove_var("TEST_MAILBRIDGE_KEYS");
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("MAILBRIDGE_ENVIRONMENT", "production");
        std::env::set_var("MAILBRIDGE_ENCRYPTION_ACTIVE_KEY_ID", "k9");
        std::env::set_var("MAILBRIDGE_SYNC_LEASE_TTL_MS", "90000");
        std::env::set_var("MAILBRIDGE_SYNC_MAX_RETRIES", "3");
        std::env::set_var("MAILBRIDGE_GMAIL_CLIENT_ID", "gmail-client");

        let config = Config::from_env().unwrap();

        assert_eq!(config.environment, Some(Environment::Production));
        assert_eq!(config.encryption.active_key_id, Some("k9".to_string()));
        assert_eq!(config.lease.ttl_ms, Some(90_000));
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(
            config.oauth.providers[&ProviderType::Gmail].client_id,
            "gmail-client"
        );

        std::env::remove_var("MAILBRIDGE_ENVIRONMENT");
        std::env::remove_var("MAILBRIDGE_ENCRYPTION_ACTIVE_KEY_ID");
        std::env::remove_var("MAILBRIDGE_SYNC_LEASE_TTL_MS");
        std::env::remove_var("MAILBRIDGE_SYNC_MAX_RETRIES");
        std::env::remove_var("MAILBRIDGE_GMAIL_CLIENT_ID");
    }

    #[test]
    fn test_parse_error_invalid_yaml() {
        let yaml = r#"
scheduler:
  max_retries: "lots"
"#;

        match Config::from_yaml(yaml) {
            Err(ConfigError::Parse(msg)) => assert!(msg.contains("Failed to parse YAML")),
            other => panic!("Expected ConfigError::Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_environment_must_be_explicit_to_run() {
        let config = Config::from_yaml("database:\n  path: /tmp/x.db\n").unwrap();
        match config.require_environment() {
            Err(ConfigError::MissingRequired(msg)) => assert!(msg.contains("MAILBRIDGE_ENVIRONMENT")),
            other => panic!("Expected ConfigError::MissingRequired, got {:?}", other),
        }

        let config = Config::from_yaml("environment: development\n").unwrap();
        assert_eq!(config.require_environment().unwrap(), Environment::Development);
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Test".parse::<Environment>().unwrap(), Environment::Test);
        assert!("staging".parse::<Environment>().is_err());
        assert!(Environment::Production.is_production());
        assert!(!Environment::Development.is_production());
    }
}
