//! Configuration module for the b2-engine tools
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation, plus an environment-only
//! mode that needs nothing but the account credentials.

use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Environment variable holding the account (or application key) id
pub const ACCOUNT_ID_ENV: &str = "B2_ACCOUNT_ID";

/// Environment variable holding the application key
pub const SECRET_KEY_ENV: &str = "B2_SECRET_KEY";

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    lazy_static::lazy_static! {
        static ref PLACEHOLDER: regex_lite::Regex =
            regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
    }
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in PLACEHOLDER.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Build a configuration from `B2_ACCOUNT_ID` and `B2_SECRET_KEY`, with
    /// defaults for everything else.
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |name: &str| {
            std::env::var(name)
                .map_err(|_| ConfigError::ValidationError(format!("{} is not set", name)))
        };
        let config = Config {
            account: AccountConfig {
                id: read(ACCOUNT_ID_ENV)?,
                key: read(SECRET_KEY_ENV)?,
            },
            client: ClientConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.id.is_empty() || self.account.id.starts_with("${") {
            return Err(ConfigError::ValidationError(
                "account.id must be set".into(),
            ));
        }
        if self.account.key.is_empty() || self.account.key.starts_with("${") {
            return Err(ConfigError::ValidationError(
                "account.key must be set".into(),
            ));
        }

        if let Some(ref api_base) = self.client.api_base {
            if !is_valid_http_url(api_base) {
                return Err(ConfigError::ValidationError(
                    "Invalid client.api_base: must start with http:// or https://".into(),
                ));
            }
        }
        if self.client.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "client.timeout_seconds must be greater than 0".into(),
            ));
        }

        if self.cleanup.page_size == 0 || self.cleanup.page_size > 10_000 {
            return Err(ConfigError::ValidationError(format!(
                "cleanup.page_size must be between 1 and 10000, got {}",
                self.cleanup.page_size
            )));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid logging.level '{}': must be one of {:?}",
                self.logging.level, LOG_LEVELS
            )));
        }

        Ok(())
    }
}

/// Account credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub key: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// HTTP client and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Alternate authorization endpoint
    #[serde(default)]
    pub api_base: Option<String>,

    /// Prepended to the default User-Agent
    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub test_mode: TestModeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            user_agent: None,
            timeout_seconds: default_timeout_seconds(),
            test_mode: TestModeConfig::default(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    300
}

impl ClientConfig {
    /// Session options for this client configuration
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()?;
        let mut options = SessionOptions::new().transport(http);
        if let Some(ref api_base) = self.api_base {
            options = options.api_base(api_base.clone());
        }
        if let Some(ref agent) = self.user_agent {
            options = options.user_agent(agent.clone());
        }
        if self.test_mode.fail_some_uploads {
            options = options.fail_some_uploads();
        }
        if self.test_mode.expire_some_tokens {
            options = options.expire_some_auth_tokens();
        }
        if self.test_mode.force_cap_exceeded {
            options = options.force_cap_exceeded();
        }
        Ok(options)
    }
}

/// Failure injection requested from the service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestModeConfig {
    #[serde(default)]
    pub fail_some_uploads: bool,
    #[serde(default)]
    pub expire_some_tokens: bool,
    #[serde(default)]
    pub force_cap_exceeded: bool,
}

/// Which buckets the cleanup tool removes, and how it pages through them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Buckets named `<account id>-<suffix>` are removed
    #[serde(default = "default_bucket_suffixes")]
    pub bucket_suffixes: Vec<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            bucket_suffixes: default_bucket_suffixes(),
            page_size: default_page_size(),
        }
    }
}

fn default_bucket_suffixes() -> Vec<String> {
    vec![
        "consistobucket".into(),
        "base-tests".into(),
        "replication-target".into(),
    ]
}

fn default_page_size() -> u32 {
    1000
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
