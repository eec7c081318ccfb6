//! Server and client configuration.
//!
//! Both configs load from TOML with per-field defaults. The server config is
//! then overridden by `RNSYNC_*` environment variables and validated.

use crate::error::{Result, SyncError};
use crate::store::StoreConfig;
use crate::types::Permission;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Log output format of the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(SyncError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// A user registered at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedUser {
    pub display_name: String,
    #[serde(default)]
    pub permissions: u32,
}

impl SeedUser {
    pub fn permission(&self) -> Permission {
        Permission(self.permissions)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,

    /// Directory of the file store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Maximum requests handled at once.
    pub workers: usize,

    /// Per-subscriber buffer on the change bus.
    pub bus_buffer: usize,

    /// Values kept in the file store's read cache.
    pub cache_size: usize,

    /// Remote subscriptions not polled for this long are reaped.
    pub subscription_idle_ms: u64,

    /// Upper bound on a single long-poll.
    pub max_poll_ms: u64,

    /// Long-polls served at once; further polls wait their turn.
    pub max_polls: usize,

    pub log_format: LogFormat,

    /// Username to display name and permission bits.
    pub users: BTreeMap<String, SeedUser>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            data_dir: None,
            workers: 10,
            bus_buffer: 1000,
            cache_size: 1000,
            subscription_idle_ms: 30_000,
            max_poll_ms: 10_000,
            max_polls: 64,
            log_format: LogFormat::Pretty,
            users: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `--config PATH` in `args` or `RNSYNC_CONFIG`, falling back
    /// to defaults, then apply environment overrides and validate.
    pub fn load(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let path = config_path_from_args(args)
            .or_else(|| std::env::var("RNSYNC_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from `RNSYNC_BIND`, `RNSYNC_DATA_DIR`,
    /// `RNSYNC_WORKERS` and `RNSYNC_LOG_FORMAT` as resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("RNSYNC_BIND") {
            self.bind = bind;
        }
        if let Some(dir) = lookup("RNSYNC_DATA_DIR") {
            self.data_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(workers) = lookup("RNSYNC_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .map_err(|_| SyncError::Config(format!("RNSYNC_WORKERS: not a number: {}", workers)))?;
        }
        if let Some(format) = lookup("RNSYNC_LOG_FORMAT") {
            self.log_format = format.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(SyncError::Config("bind must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be > 0".to_string()));
        }
        if self.bus_buffer == 0 {
            return Err(SyncError::Config("bus_buffer must be > 0".to_string()));
        }
        if self.max_poll_ms == 0 {
            return Err(SyncError::Config("max_poll_ms must be > 0".to_string()));
        }
        if self.max_polls == 0 {
            return Err(SyncError::Config("max_polls must be > 0".to_string()));
        }
        if self.subscription_idle_ms == 0 {
            return Err(SyncError::Config("subscription_idle_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// File store settings, if a data directory is configured.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.data_dir.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            cache_size: self.cache_size,
            create_if_missing: true,
        })
    }

    pub fn subscription_idle(&self) -> Duration {
        Duration::from_millis(self.subscription_idle_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub server_url: String,
    pub username: String,
    /// Timeout of every HTTP request.
    pub request_timeout_ms: u64,
    /// How long the listener waits for a message before checking for stop.
    pub poll_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            username: String::new(),
            request_timeout_ms: 10_000,
            poll_timeout_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let config: ClientConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(SyncError::Config("server_url must not be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(SyncError::Config("username must not be empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be > 0".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(SyncError::Config("poll_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn config_path_from_args(args: impl IntoIterator<Item = String>) -> Option<PathBuf> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.workers, 10);
        assert_eq!(config.bus_buffer, 1000);
        assert_eq!(config.max_polls, 64);
        assert!(config.store_config().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_server_toml_with_users() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind = "0.0.0.0:8080"
            data_dir = "/var/lib/rnsync"
            log_format = "json"

            [users.ann]
            display_name = "Ann Lee"
            permissions = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.users["ann"].permission().can_edit());
        assert_eq!(
            config.store_config().unwrap().path,
            PathBuf::from("/var/lib/rnsync")
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("wokers = 3"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RNSYNC_BIND", "127.0.0.1:0"),
            ("RNSYNC_WORKERS", "4"),
            ("RNSYNC_LOG_FORMAT", "JSON"),
            ("RNSYNC_DATA_DIR", "/tmp/rn"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bind, "127.0.0.1:0");
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/rn")));

        let bad = config.apply_env(|name| (name == "RNSYNC_WORKERS").then(|| "many".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let config = ServerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_poll_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_polls: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_path_from_args() {
        let args = ["--verbose", "--config", "a.toml"].map(String::from);
        assert_eq!(config_path_from_args(args), Some(PathBuf::from("a.toml")));
        let args = ["--config=b.toml"].map(String::from);
        assert_eq!(config_path_from_args(args), Some(PathBuf::from("b.toml")));
        assert_eq!(config_path_from_args(Vec::new()), None);
    }

    #[test]
    fn test_client_config() {
        let config: ClientConfig = toml::from_str(r#"username = "ann""#).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        config.validate().unwrap();
        assert!(ClientConfig::default().validate().is_err());
    }
}
