//! Configuration management for Redcast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub reddit: RedditConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// App-level Reddit API settings shared by every linked account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditConfig {
    /// OAuth app client id used for the refresh-token grant
    pub client_id: String,
    /// OAuth app client secret
    pub client_secret: String,
    /// Fixed identifying header sent on every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Base URL for authenticated API calls
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Base URL for the token endpoint
    #[serde(default = "default_auth_base")]
    pub auth_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between poll ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upstream per-credential request quota per rate window
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Seconds between full post-sync passes; 0 disables sync
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            requests_per_window: default_requests_per_window(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

/// Operator control surface settings. Absent section means no HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every route except the health check.
    /// Leaving this unset keeps the surface open; do not do that outside
    /// a trusted network.
    pub auth_token: Option<String>,
}

fn default_user_agent() -> String {
    format!("redcast/{} (campaign scheduler)", env!("CARGO_PKG_VERSION"))
}

fn default_api_base() -> String {
    "https://oauth.reddit.com".to_string()
}

fn default_auth_base() -> String {
    "https://www.reddit.com".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_sync_interval() -> u64 {
    3600
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        if config.reddit.client_id.is_empty() {
            return Err(ConfigError::MissingField("reddit.client_id".to_string()).into());
        }
        if config.reddit.client_secret.is_empty() {
            return Err(ConfigError::MissingField("reddit.client_secret".to_string()).into());
        }
        Ok(config)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("REDCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("redcast").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("redcast"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [database]
        path = "/tmp/redcast-test.db"

        [reddit]
        client_id = "app-id"
        client_secret = "app-secret"
    "#;

    #[test]
    fn test_parse_minimal_applies_defaults() {
        let config = Config::parse(MINIMAL).unwrap();

        assert_eq!(config.database.path, "/tmp/redcast-test.db");
        assert_eq!(config.reddit.api_base, "https://oauth.reddit.com");
        assert_eq!(config.reddit.auth_base, "https://www.reddit.com");
        assert!(config.reddit.user_agent.starts_with("redcast/"));
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.requests_per_window, 60);
        assert!(config.server.is_none());
    }

    #[test]
    fn test_parse_full() {
        let config = Config::parse(
            r#"
            [database]
            path = "~/.local/share/redcast/redcast.db"

            [reddit]
            client_id = "app-id"
            client_secret = "app-secret"
            user_agent = "redcast-test/0.0"
            api_base = "http://127.0.0.1:9001"
            auth_base = "http://127.0.0.1:9002"

            [scheduler]
            poll_interval_secs = 15
            requests_per_window = 30
            sync_interval_secs = 0

            [server]
            bind = "0.0.0.0:9090"
            auth_token = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.poll_interval_secs, 15);
        assert_eq!(config.scheduler.requests_per_window, 30);
        assert_eq!(config.scheduler.sync_interval_secs, 0);
        let server = config.server.unwrap();
        assert_eq!(server.bind, "0.0.0.0:9090");
        assert_eq!(server.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_parse_rejects_empty_client_id() {
        let result = Config::parse(
            r#"
            [database]
            path = "/tmp/x.db"

            [reddit]
            client_id = ""
            client_secret = "secret"
            "#,
        );

        match result {
            Err(crate::RedcastError::Config(ConfigError::MissingField(field))) => {
                assert_eq!(field, "reddit.client_id");
            }
            other => panic!("expected missing-field error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        let result = Config::parse("not toml at all [");
        assert!(matches!(
            result,
            Err(crate::RedcastError::Config(ConfigError::ParseError(_)))
        ));
    }
}
