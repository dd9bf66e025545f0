//! Configuration for tablepub.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Files are read
//! from `~/.config/tablepub/config.toml` and `.tablepub/config.toml` in the
//! workspace directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Success emails; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfig>,
    /// Remote live-channel endpoint; events stay in-process when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveConfig>,
    /// Social announcements; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<AnnounceConfig>,
}

impl PublishConfig {
    /// Problems across every section, prefixed with the section name.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut section = |name: &str, found: Vec<String>| {
            problems.extend(found.into_iter().map(|p| format!("[{name}] {p}")));
        };
        section("host", self.host.validate());
        section("storage", self.storage.validate());
        section("store", self.store.validate());
        section("jobs", self.jobs.validate());
        if let Some(email) = &self.email {
            section("email", email.validate());
        }
        if let Some(live) = &self.live {
            section("live", live.validate());
        }
        if let Some(announce) = &self.announce {
            section("announce", announce.validate());
        }
        problems
    }
}

/// Repository host access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Base URL of the REST API.
    pub api_url: String,
    /// Token used for repository operations on behalf of users.
    #[serde(default)]
    pub token: String,
    /// Administrative token used to look up organisation details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: String::new(),
            admin_token: None,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if url::Url::parse(&self.api_url).is_err() {
            problems.push(format!("api_url '{}' is not a valid URL", self.api_url));
        }
        if self.token.trim().is_empty() {
            problems.push("token is empty; remote publishing will fail".to_string());
        }
        problems
    }
}

/// Where raw uploaded bytes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from(".tablepub/uploads"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.backend == StorageBackend::Local && self.root.as_os_str().is_empty() {
            problems.push("root must be set for the local backend".to_string());
        }
        problems
    }
}

/// Where datasets and Error Records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Document path for the JSON backend.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            path: PathBuf::from(".tablepub/datasets.json"),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.backend == StoreBackend::Json && self.path.as_os_str().is_empty() {
            problems.push("path must be set for the json backend".to_string());
        }
        problems
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Seconds a finished job stays pollable before it is evicted.
    pub retain_finished_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retain_finished_secs: 3600,
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retain_finished_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        if self.retain_finished_secs == 0 {
            vec!["retain_finished_secs is 0; job status cannot be polled".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// SMTP delivery of success emails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl EmailConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.smtp_host.trim().is_empty() {
            problems.push("smtp_host is empty".to_string());
        }
        if !self.from_address.contains('@') {
            problems.push(format!(
                "from_address '{}' is not an email address",
                self.from_address
            ));
        }
        problems
    }
}

/// Remote live-channel delivery over a signed webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub webhook_url: String,
    /// HMAC-SHA256 key for the `X-Tablepub-Signature` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl LiveConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if url::Url::parse(&self.webhook_url).is_err() {
            problems.push(format!(
                "webhook_url '{}' is not a valid URL",
                self.webhook_url
            ));
        }
        if self.secret.as_deref().is_some_and(|s| s.is_empty()) {
            problems.push("secret is set but empty".to_string());
        }
        problems
    }
}

/// Social announcement of newly published datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    pub webhook_url: String,
}

impl AnnounceConfig {
    pub fn validate(&self) -> Vec<String> {
        if url::Url::parse(&self.webhook_url).is_err() {
            vec![format!(
                "webhook_url '{}' is not a valid URL",
                self.webhook_url
            )]
        } else {
            Vec::new()
        }
    }
}

/// Load configuration from all sources, later sources taking precedence:
/// 1. Built-in defaults
/// 2. User config (`~/.config/tablepub/config.toml`)
/// 3. Workspace config (`.tablepub/config.toml`)
/// 4. Environment variables (prefixed with `TABLEPUB_`)
/// 5. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PublishConfig>,
) -> Result<PublishConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PublishConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("org", "tablepub", "tablepub") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".tablepub").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TABLEPUB_HOST__TOKEN, TABLEPUB_STORE__PATH, ...
    figment = figment.merge(Env::prefixed("TABLEPUB_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PublishConfig::default();
        assert_eq!(config.host.api_url, "https://api.github.com");
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.store.path, PathBuf::from(".tablepub/datasets.json"));
        assert_eq!(config.jobs.retain_finished_secs, 3600);
        assert!(config.email.is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = PublishConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: PublishConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.host.api_url, config.host.api_url);
        assert_eq!(back.jobs.retain_finished_secs, config.jobs.retain_finished_secs);
    }

    #[test]
    fn test_validate_reports_sections() {
        let mut config = PublishConfig::default();
        config.jobs.retain_finished_secs = 0;
        config.email = Some(EmailConfig {
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            from_address: "nobody".into(),
        });
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.starts_with("[host] token is empty")));
        assert!(problems.iter().any(|p| p.starts_with("[jobs]")));
        assert_eq!(problems.iter().filter(|p| p.starts_with("[email]")).count(), 2);
    }

    #[test]
    fn test_live_config_validation() {
        let live = LiveConfig {
            webhook_url: "not a url".into(),
            secret: Some(String::new()),
        };
        assert_eq!(live.validate().len(), 2);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = PublishConfig::default();
        overrides.host.token = "override-token".into();
        overrides.jobs.retain_finished_secs = 7;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.host.token, "override-token");
        assert_eq!(config.jobs.retention(), Duration::from_secs(7));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".tablepub");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[host]
api_url = "https://github.example.org/api/v3"
token = "ws-token"

[store]
backend = "memory"
path = ""

[announce]
webhook_url = "https://hooks.example.org/announce"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.host.api_url, "https://github.example.org/api/v3");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.store.validate().is_empty());
        assert_eq!(
            config.announce.unwrap().webhook_url,
            "https://hooks.example.org/announce"
        );
    }
}
