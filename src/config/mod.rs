use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::error::{RelayError, Result};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub imap: ImapConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

/// IMAP server configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,

    /// IMAP server port (implicit TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Login user, usually the shared mailbox address
    pub user: String,

    pub password: String,

    /// Folder holding the relayed mail
    #[serde(default = "default_folder")]
    pub folder: String,

    /// Skip certificate validation (self-signed test servers)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

// Keeps the password out of logs.
impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("folder", &self.folder)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

/// Retrieval tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Messages older than this many minutes are never returned
    #[serde(default = "default_freshness_minutes")]
    pub freshness_minutes: i64,

    /// Newest search hits whose bodies are fetched per call
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Upper bound for one mailbox round-trip, lock wait included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Pattern store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Insert the stock subject patterns on startup
    #[serde(default = "default_true")]
    pub seed_defaults: bool,
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "HOUSEHOLD".to_string()
}

fn default_freshness_minutes() -> i64 {
    15
}

fn default_max_candidates() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("otp-relay"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patterns.db")
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            freshness_minutes: default_freshness_minutes(),
            max_candidates: default_max_candidates(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            seed_defaults: true,
        }
    }
}

impl RetrievalConfig {
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.freshness_minutes)
            .unwrap_or_else(|| chrono::Duration::minutes(default_freshness_minutes()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// Load from an explicit path, or the first default path that exists,
    /// then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_paths().into_iter().find(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                let content = fs::read_to_string(&path).map_err(|e| {
                    RelayError::Config(format!("Failed to read {:?}: {}", path, e))
                })?;
                Self::from_toml(&content)?
            }
            None => {
                info!("No config file found, building config from environment");
                Self::from_toml(ENV_ONLY_SKELETON)?
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override file values with `IMAP_*` / `OTP_RELAY_DB` variables.
    pub fn apply_env_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("IMAP_HOST") {
            self.imap.host = host;
        }
        if let Some(port) = var("IMAP_PORT") {
            self.imap.port = port
                .parse()
                .map_err(|_| RelayError::Config(format!("IMAP_PORT is not a port: {}", port)))?;
        }
        if let Some(user) = var("IMAP_USER") {
            self.imap.user = user;
        }
        if let Some(password) = var("IMAP_PASSWORD") {
            self.imap.password = password;
        }
        if let Some(folder) = var("IMAP_FOLDER") {
            self.imap.folder = folder;
        }
        if let Some(flag) = var("IMAP_ACCEPT_INVALID_CERTS") {
            self.imap.accept_invalid_certs = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
        if let Some(path) = var("OTP_RELAY_DB") {
            self.database.path = PathBuf::from(path);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.imap.host.trim().is_empty() {
            return Err(RelayError::Config("imap.host is not set".to_string()));
        }
        if self.imap.user.trim().is_empty() {
            return Err(RelayError::Config("imap.user is not set".to_string()));
        }
        if self.retrieval.max_candidates == 0 {
            return Err(RelayError::Config(
                "retrieval.max_candidates must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_FRESHNESS_MINUTES).contains(&self.retrieval.freshness_minutes) {
            return Err(RelayError::Config(format!(
                "retrieval.freshness_minutes must be between 1 and {}",
                MAX_FRESHNESS_MINUTES
            )));
        }
        if self.retrieval.request_timeout_secs == 0 {
            return Err(RelayError::Config(
                "retrieval.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One week; codes are useless long before that
const MAX_FRESHNESS_MINUTES: i64 = 7 * 24 * 60;

const ENV_ONLY_SKELETON: &str = r#"
[imap]
host = ""
user = ""
password = ""
"#;

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("otp-relay").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("otp-relay").join("config.toml"));
        paths.push(home_dir.join(".otp-relay.rc"));
    }

    paths
}
