//! Runtime configuration
//!
//! The configuration lives in a YAML file (`config.yaml` by default). Missing files are
//! created with defaults on first start, and every section falls back to its defaults when
//! omitted. Any key can be overridden from the environment with the `CLOUDMAIL__` prefix,
//! e.g. `CLOUDMAIL__SERVER__PORT=8080`.

use crate::error::{CloudMailError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub cloudflare: Vec<CloudflareZone>,
    pub email: EmailConfig,
    pub logging: LoggingConfig,
    pub admin: AdminConfig,
    pub jwt: JwtSettings,
    pub login_limiter: LoginLimiterConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// `http`, `https` or `socks5`
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

/// One Cloudflare zone that hosts disposable addresses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudflareZone {
    /// Mail domain, with or without a leading `@`
    pub domain: String,
    /// Destination address every route of this zone forwards to
    pub email_forward: String,
    pub api_token: String,
    pub zone_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailConfig {
    /// IMAP login of the collecting mailbox
    pub user: String,
    pub pass: String,
    /// Minutes between scheduled fetches
    pub fetch_interval: u64,
    pub mailbox: String,
    pub imap: ImapSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JwtSettings {
    pub secret: String,
    /// `24h`, `30m`, `7d` or a plain number of seconds
    pub expires_in: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoginLimiterConfig {
    pub max_attempts: u32,
    pub lock_time_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub attachments_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7890,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            pass: String::new(),
            fetch_interval: 10,
            mailbox: "INBOX".to_string(),
            imap: ImapSettings::default(),
        }
    }
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "imap.gmail.com".to_string(),
            port: 993,
            secure: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production".to_string(),
            expires_in: "24h".to_string(),
        }
    }
}

impl Default for LoginLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lock_time_ms: 10 * 60 * 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/database.sqlite?mode=rwc".to_string(),
            attachments_dir: "data/attachments".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ProxyConfig {
    /// Proxy URL when the proxy is enabled
    pub fn url(&self) -> Option<String> {
        self.enabled
            .then(|| format!("{}://{}:{}", self.protocol, self.host, self.port))
    }
}

impl CloudflareZone {
    /// Domain without the leading `@`, lowercased
    pub fn bare_domain(&self) -> String {
        self.domain.trim().trim_start_matches('@').to_lowercase()
    }

    fn validate(&self) -> Result<()> {
        if self.bare_domain().is_empty() {
            return Err(CloudMailError::Config("Cloudflare zone without domain".to_string()));
        }
        if self.zone_id.trim().is_empty() || self.api_token.trim().is_empty() {
            return Err(CloudMailError::Config(format!(
                "Cloudflare zone {} needs zone_id and api_token",
                self.bare_domain()
            )));
        }
        if !self.email_forward.contains('@') {
            return Err(CloudMailError::Config(format!(
                "Cloudflare zone {} needs a forward address",
                self.bare_domain()
            )));
        }
        Ok(())
    }
}

impl JwtSettings {
    pub fn expiration(&self) -> Result<Duration> {
        parse_duration(&self.expires_in)
    }
}

impl LoginLimiterConfig {
    pub fn lock_time(&self) -> Duration {
        Duration::from_millis(self.lock_time_ms)
    }
}

impl Config {
    /// Load the YAML file at `path`, writing defaults first when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, writing defaults", path.display());
            Config::default().save(path)?;
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("CLOUDMAIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CloudMailError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CloudMailError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.email.fetch_interval == 0 {
            return Err(CloudMailError::Config(
                "email.fetch_interval must be at least one minute".to_string(),
            ));
        }
        if self.login_limiter.max_attempts == 0 {
            return Err(CloudMailError::Config(
                "login_limiter.max_attempts must be positive".to_string(),
            ));
        }
        self.jwt.expiration()?;
        for zone in &self.cloudflare {
            zone.validate()?;
        }
        Ok(())
    }

    /// Zone serving `domain` (leading `@` and case ignored)
    pub fn zone_for_domain(&self, domain: &str) -> Option<&CloudflareZone> {
        let wanted = domain.trim().trim_start_matches('@').to_lowercase();
        self.cloudflare.iter().find(|z| z.bare_domain() == wanted)
    }

    /// All configured mail domains
    pub fn domains(&self) -> Vec<String> {
        self.cloudflare.iter().map(|z| z.bare_domain()).collect()
    }
}

/// Parse `"24h"`, `"30m"`, `"7d"`, `"45s"` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || CloudMailError::Config(format!("invalid duration: {:?}", value));

    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Shared, updatable view of the configuration.
///
/// Edits go through [`ConfigHandle::update`], which validates the new configuration and
/// persists it before it becomes visible to readers.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Handle that never touches the filesystem
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, None)
    }

    pub async fn snapshot(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn update<F>(&self, edit: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        edit(&mut next);
        next.validate()?;

        if let Some(path) = &self.path {
            next.save(path)?;
        }
        *guard = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.email.fetch_interval, 10);
        assert_eq!(config.email.imap.port, 993);
        assert_eq!(config.login_limiter.max_attempts, 5);
        assert_eq!(config.login_limiter.lock_time(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_load_writes_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let config = Config::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.admin.username, "admin");
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
server:
  port: 8080
cloudflare:
  - domain: "@example.com"
    email_forward: inbox@gmail.com
    api_token: token
    zone_id: zone
email:
  user: collector@gmail.com
  fetch_interval: 5
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.email.fetch_interval, 5);
        assert_eq!(config.email.imap.host, "imap.gmail.com");
        assert_eq!(config.domains(), vec!["example.com".to_string()]);
        assert!(config.zone_for_domain("EXAMPLE.com").is_some());
        assert!(config.zone_for_domain("@example.com").is_some());
        assert!(config.zone_for_domain("other.com").is_none());
    }

    #[test]
    fn test_incomplete_zone_rejected() {
        let mut config = Config::default();
        config.cloudflare.push(CloudflareZone {
            domain: "example.com".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_url() {
        let mut proxy = ProxyConfig::default();
        assert!(proxy.url().is_none());
        proxy.enabled = true;
        proxy.protocol = "socks5".to_string();
        assert_eq!(proxy.url().unwrap(), "socks5://127.0.0.1:7890");
    }

    #[tokio::test]
    async fn test_handle_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let handle = ConfigHandle::new(Config::default(), Some(path.clone()));

        handle
            .update(|c| c.email.fetch_interval = 15)
            .await
            .unwrap();

        assert_eq!(handle.snapshot().await.email.fetch_interval, 15);
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.email.fetch_interval, 15);
    }

    #[tokio::test]
    async fn test_handle_rejects_invalid_update() {
        let handle = ConfigHandle::in_memory(Config::default());
        let result = handle.update(|c| c.email.fetch_interval = 0).await;
        assert!(result.is_err());
        assert_eq!(handle.snapshot().await.email.fetch_interval, 10);
    }
}
