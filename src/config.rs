//! Settings file. Every section is defaulted field by field, so partial or
//! older files keep loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "settings.json";
pub const CONFIG_PATH_ENV: &str = "SESMAIL_CONFIG";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// One day.
pub const MAX_DELAY_SECONDS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub source_email: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: "us-east-1".to_string(),
            source_email: String::new(),
        }
    }
}

impl AwsConfig {
    pub fn has_static_credentials(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub sender_name: String,
    pub reply_to: String,
    pub default_to: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            sender_name: "SES Email Sender".to_string(),
            reply_to: String::new(),
            default_to: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub delay_seconds: f64,
    pub use_bcc: bool,
    /// Mark the failed records consumed by a retry once the retry delivers them.
    pub mark_retried_on_success: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            delay_seconds: 60.0,
            use_bcc: true,
            mark_retried_on_success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aws: AwsConfig,
    pub sender: SenderConfig,
    pub batch: BatchConfig,
    pub files_directory: PathBuf,
    pub data_directory: PathBuf,
    pub database_path: PathBuf,
    pub last_excel_path: String,
    pub last_excel_column: usize,
    pub test_recipients: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aws: AwsConfig::default(),
            sender: SenderConfig::default(),
            batch: BatchConfig::default(),
            files_directory: PathBuf::from("files"),
            data_directory: PathBuf::from("data"),
            database_path: PathBuf::from("emails.db"),
            last_excel_path: String::new(),
            last_excel_column: 0,
            test_recipients: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Path of the settings file: the explicit path if given, then
    /// `SESMAIL_CONFIG`, then `settings.json`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => env::var(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        }
    }

    /// Load the settings at `path`. A missing file yields the defaults; a
    /// malformed one is reported and also yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed settings file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Record the last recipient file in the settings at `path`. Only those
    /// two keys change; the rest of the file is re-read, not taken from the
    /// caller.
    pub fn remember_recipient_file(path: &Path, file: &Path, column: usize) -> Result<()> {
        let mut stored = Self::load(path)?;
        stored.last_excel_path = file.display().to_string();
        stored.last_excel_column = column;
        stored.save(path)
    }

    pub fn is_configured(&self) -> bool {
        self.aws.has_static_credentials()
            && !self.aws.region.is_empty()
            && !self.aws.source_email.is_empty()
    }

    /// Everything a send run needs before the first chunk.
    pub fn validate_for_sending(&self) -> Result<()> {
        if self.aws.source_email.trim().is_empty() {
            anyhow::bail!("Source email is not configured (aws.source_email)");
        }
        if self.aws.region.trim().is_empty() {
            anyhow::bail!("AWS region is not configured (aws.region)");
        }
        if self.batch.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than zero (batch.batch_size)");
        }
        if !self.batch.delay_seconds.is_finite() || self.batch.delay_seconds < 0.0 {
            anyhow::bail!("Batch delay must be a non-negative number of seconds");
        }
        if self.batch.delay_seconds > MAX_DELAY_SECONDS {
            anyhow::bail!(
                "Batch delay must be at most {} seconds (batch.delay_seconds)",
                MAX_DELAY_SECONDS
            );
        }
        Ok(())
    }

    /// `DATABASE_URL` wins over the configured path.
    pub fn database_location(&self) -> PathBuf {
        env::var(DATABASE_URL_ENV)
            .ok()
            .map(|url| PathBuf::from(url.trim_start_matches("sqlite://").trim_start_matches("sqlite:")))
            .unwrap_or_else(|| self.database_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.batch.batch_size, 50);
        assert!(config.batch.use_bcc);
        assert!(!config.batch.mark_retried_on_success);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"aws": {"source_email": "news@acme.com"}, "batch": {"batch_size": 10}, "unknown": 1}"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.aws.source_email, "news@acme.com");
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.delay_seconds, 60.0);
        assert_eq!(config.sender.sender_name, "SES Email Sender");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn save_creates_parent_directory_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut config = AppConfig::default();
        config.test_recipients = vec!["me@acme.com".to_string()];
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn remember_recipient_file_leaves_other_settings_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut stored = AppConfig::default();
        stored.aws.source_email = "news@acme.com".to_string();
        stored.save(&path).unwrap();

        // One-off overrides on the in-memory copy must not reach the file.
        let mut session_config = AppConfig::load(&path).unwrap();
        session_config.batch.use_bcc = false;
        session_config.aws.source_email = "draft@acme.com".to_string();

        AppConfig::remember_recipient_file(&path, Path::new("lists/march.csv"), 2).unwrap();

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.last_excel_path, "lists/march.csv");
        assert_eq!(reloaded.last_excel_column, 2);
        assert!(reloaded.batch.use_bcc);
        assert_eq!(reloaded.aws.source_email, "news@acme.com");
    }

    #[test]
    fn is_configured_requires_credentials_and_source() {
        let mut config = AppConfig::default();
        assert!(!config.is_configured());
        config.aws.access_key_id = "AKIA".to_string();
        config.aws.secret_access_key = "secret".to_string();
        assert!(!config.is_configured());
        config.aws.source_email = "news@acme.com".to_string();
        assert!(config.is_configured());
    }

    #[test]
    fn validate_for_sending_rejects_incomplete_settings() {
        let mut config = AppConfig::default();
        assert!(config.validate_for_sending().is_err());

        config.aws.source_email = "news@acme.com".to_string();
        assert!(config.validate_for_sending().is_ok());

        config.batch.batch_size = 0;
        assert!(config.validate_for_sending().is_err());
        config.batch.batch_size = 5;
        config.batch.delay_seconds = -1.0;
        assert!(config.validate_for_sending().is_err());
        config.batch.delay_seconds = 1e300;
        assert!(config.validate_for_sending().is_err());
        config.batch.delay_seconds = MAX_DELAY_SECONDS;
        assert!(config.validate_for_sending().is_ok());
    }
}
