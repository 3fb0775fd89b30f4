//! Runtime configuration.
//!
//! Environment variables are the primary source; a config file (TOML or
//! JSON, picked by extension) is the fallback. Credentials come from
//! `REDDIT_CLIENT_ID` / `REDDIT_CLIENT_SECRET` and are never logged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionConfig;
use crate::circuit::CircuitConfig;
use crate::client::ClientConfig;
use crate::enrich::EnrichConfig;

/// Default store filename inside the data directory.
pub const DEFAULT_DATABASE_FILENAME: &str = "snooscrape.db";

/// Fully-resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database_filename: String,
    pub bind_host: String,
    pub bind_port: u16,
    pub forum_base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub forum_rate: f64,
    pub forum_max_rate: f64,
    pub max_connections: usize,
    pub default_workers: u32,
    /// Pace outbound calls through the store file so several worker
    /// processes share one line.
    pub shared_admission: bool,
    /// Retention window for posts/users/metrics; `None` disables gc.
    pub retention_days: Option<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snooscrape");
        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8000,
            forum_base_url: "https://www.reddit.com".to_string(),
            user_agent: "snooscrape/0.3 (research)".to_string(),
            request_timeout: Duration::from_secs(30),
            client_id: None,
            client_secret: None,
            forum_rate: 1.0,
            forum_max_rate: 10.0,
            max_connections: 20,
            default_workers: 5,
            shared_admission: false,
            retention_days: None,
        }
    }
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.forum_base_url.clone(),
            user_agent: self.user_agent.clone(),
            timeout: self.request_timeout,
            credentials: self
                .client_id
                .clone()
                .zip(self.client_secret.clone()),
            ..ClientConfig::default()
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            rate: self.forum_rate,
            max_rate: self.forum_max_rate,
            ..AdmissionConfig::default()
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig::default()
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig {
            user_agent: self.user_agent.clone(),
            ..EnrichConfig::default()
        }
    }

    /// Non-secret projection served by `/config`.
    pub fn public_view(&self) -> PublicConfig {
        PublicConfig {
            data_dir: self.data_dir.display().to_string(),
            forum_base_url: self.forum_base_url.clone(),
            user_agent: self.user_agent.clone(),
            request_timeout_secs: self.request_timeout.as_secs(),
            forum_rate: self.forum_rate,
            max_connections: self.max_connections,
            default_workers: self.default_workers,
            shared_admission: self.shared_admission,
            retention_days: self.retention_days,
            credentials_configured: self.client_id.is_some() && self.client_secret.is_some(),
        }
    }

    /// Load settings: file fallback first (if present), then env
    /// overrides on top.
    pub fn load(config_path: Option<&Path>) -> Result<Self, String> {
        let mut settings = Settings::default();

        let file = match config_path {
            Some(path) => Some(ConfigFile::from_path(path)?),
            None => ConfigFile::discover(),
        };
        if let Some(file) = file {
            file.apply(&mut settings);
        }
        apply_env(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), String> {
        if self.forum_rate <= 0.0 {
            return Err("forum_rate must be positive".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        if self.default_workers == 0 {
            return Err("default_workers must be at least 1".into());
        }
        if self.client_id.is_some() != self.client_secret.is_some() {
            return Err("client_id and client_secret must be set together".into());
        }
        Ok(())
    }
}

/// Non-secret configuration view.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConfig {
    pub data_dir: String,
    pub forum_base_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub forum_rate: f64,
    pub max_connections: usize,
    pub default_workers: u32,
    pub shared_admission: bool,
    pub retention_days: Option<i64>,
    pub credentials_configured: bool,
}

/// On-disk configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub data_dir: Option<String>,
    pub database: Option<String>,
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
    pub forum_base_url: Option<String>,
    pub user_agent: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub forum_rate: Option<f64>,
    pub forum_max_rate: Option<f64>,
    pub max_connections: Option<usize>,
    pub default_workers: Option<u32>,
    pub shared_admission: Option<bool>,
    pub retention_days: Option<i64>,
}

impl ConfigFile {
    /// Parse by extension: `.toml` or JSON.
    pub fn from_path(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&contents).map_err(|e| format!("invalid TOML config: {e}"))
            }
            _ => serde_json::from_str(&contents).map_err(|e| format!("invalid JSON config: {e}")),
        }
    }

    /// Look for `snooscrape.{toml,json}` in the working directory.
    fn discover() -> Option<Self> {
        for name in ["snooscrape.toml", "snooscrape.json"] {
            let path = Path::new(name);
            if path.exists() {
                match Self::from_path(path) {
                    Ok(config) => return Some(config),
                    Err(e) => {
                        tracing::warn!("ignoring {}: {e}", path.display());
                        return None;
                    }
                }
            }
        }
        None
    }

    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.data_dir {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = &self.database {
            settings.database_filename = v.clone();
        }
        if let Some(v) = &self.bind_host {
            settings.bind_host = v.clone();
        }
        if let Some(v) = self.bind_port {
            settings.bind_port = v;
        }
        if let Some(v) = &self.forum_base_url {
            settings.forum_base_url = v.clone();
        }
        if let Some(v) = &self.user_agent {
            settings.user_agent = v.clone();
        }
        if let Some(v) = self.request_timeout_secs {
            settings.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = &self.client_id {
            settings.client_id = Some(v.clone());
        }
        if let Some(v) = &self.client_secret {
            settings.client_secret = Some(v.clone());
        }
        if let Some(v) = self.forum_rate {
            settings.forum_rate = v;
        }
        if let Some(v) = self.forum_max_rate {
            settings.forum_max_rate = v;
        }
        if let Some(v) = self.max_connections {
            settings.max_connections = v;
        }
        if let Some(v) = self.default_workers {
            settings.default_workers = v;
        }
        if let Some(v) = self.shared_admission {
            settings.shared_admission = v;
        }
        if let Some(v) = self.retention_days {
            settings.retention_days = Some(v);
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn apply_env(settings: &mut Settings) {
    if let Some(v) = env_var("SNOOSCRAPE_DATA_DIR") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = env_var("SNOOSCRAPE_DATABASE") {
        settings.database_filename = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_BIND_HOST") {
        settings.bind_host = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_BIND_PORT").and_then(|v| v.parse().ok()) {
        settings.bind_port = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_FORUM_URL") {
        settings.forum_base_url = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_USER_AGENT") {
        settings.user_agent = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_RATE").and_then(|v| v.parse().ok()) {
        settings.forum_rate = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_WORKERS").and_then(|v| v.parse().ok()) {
        settings.default_workers = v;
    }
    if let Some(v) = env_var("SNOOSCRAPE_RETENTION_DAYS").and_then(|v| v.parse().ok()) {
        settings.retention_days = Some(v);
    }
    if let Some(v) = env_var("SNOOSCRAPE_SHARED_ADMISSION") {
        settings.shared_admission = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Some(v) = env_var("REDDIT_CLIENT_ID") {
        settings.client_id = Some(v);
    }
    if let Some(v) = env_var("REDDIT_CLIENT_SECRET") {
        settings.client_secret = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snooscrape.toml");
        std::fs::write(
            &path,
            r#"
            forum_rate = 2.5
            default_workers = 3
            bind_port = 9001
            "#,
        )
        .unwrap();

        let file = ConfigFile::from_path(&path).unwrap();
        let mut settings = Settings::default();
        file.apply(&mut settings);
        assert!((settings.forum_rate - 2.5).abs() < 1e-9);
        assert_eq!(settings.default_workers, 3);
        assert_eq!(settings.bind_port, 9001);
    }

    #[test]
    fn json_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"user_agent": "custom/1.0"}"#).unwrap();
        let file = ConfigFile::from_path(&path).unwrap();
        assert_eq!(file.user_agent.as_deref(), Some("custom/1.0"));
    }

    #[test]
    fn lone_credential_is_invalid() {
        let settings = Settings {
            client_id: Some("id".into()),
            client_secret: None,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn public_view_has_no_secrets() {
        let settings = Settings {
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };
        let view = settings.public_view();
        assert!(view.credentials_configured);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("secret"));
    }
}
