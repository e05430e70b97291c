use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Server used by queries that do not name one
  pub server: Option<String>,
  /// URL scheme for the data API and push channel
  pub protocol: String,
  /// How long results stay fresh while the push channel is live
  pub refresh_interval_secs: u64,
  /// How long results stay fresh while the push channel is down
  pub disconnected_refresh_interval_secs: u64,
  pub reconnect: ReconnectConfig,
  pub cache: CacheConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the blob holding local-schema rows
  pub database: String,
  /// SQLite file (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Number of Searches kept in the registry
  pub max_searches: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Directory for the rolling log file (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server: None,
      protocol: "https".to_string(),
      refresh_interval_secs: 60 * 60,
      disconnected_refresh_interval_secs: 30,
      reconnect: ReconnectConfig::default(),
      cache: CacheConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      initial_delay_ms: 500,
      max_delay_ms: 30_000,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      database: "trambar".to_string(),
      path: None,
      max_searches: 256,
    }
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./trambar-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/trambar-sync/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("trambar-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("trambar-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.reconnect.initial_delay_ms == 0 {
      return Err(eyre!("reconnect.initial_delay_ms must be positive"));
    }
    if config.reconnect.max_delay_ms < config.reconnect.initial_delay_ms {
      return Err(eyre!("reconnect.max_delay_ms must not be below initial_delay_ms"));
    }
    Ok(config)
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::seconds(self.refresh_interval_secs as i64)
  }

  pub fn disconnected_refresh_interval(&self) -> Duration {
    Duration::seconds(self.disconnected_refresh_interval_secs as i64)
  }

  /// Directory for log files.
  pub fn log_directory(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.directory {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("trambar-sync").join("logs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.protocol, "https");
    assert_eq!(config.refresh_interval(), Duration::hours(1));
    assert_eq!(config.disconnected_refresh_interval(), Duration::seconds(30));
    assert_eq!(config.reconnect.initial_delay_ms, 500);
    assert_eq!(config.cache.database, "trambar");
    assert_eq!(config.cache.max_searches, 256);
  }

  #[test]
  fn test_partial_config_overrides() {
    let config = Config::parse(
      r#"
server: trambar.example.net
refresh_interval_secs: 600
reconnect:
  max_delay_ms: 10000
cache:
  max_searches: 32
log:
  level: debug
"#,
    )
    .unwrap();
    assert_eq!(config.server.as_deref(), Some("trambar.example.net"));
    assert_eq!(config.refresh_interval(), Duration::minutes(10));
    assert_eq!(config.reconnect.initial_delay_ms, 500);
    assert_eq!(config.reconnect.max_delay_ms, 10_000);
    assert_eq!(config.cache.max_searches, 32);
    assert_eq!(config.log.level, "debug");
  }

  #[test]
  fn test_invalid_reconnect_delays() {
    assert!(Config::parse("reconnect:\n  initial_delay_ms: 0\n").is_err());
    assert!(Config::parse("reconnect:\n  initial_delay_ms: 900\n  max_delay_ms: 100\n").is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    assert!(Config::load(Some(Path::new("/nonexistent/trambar-sync.yaml"))).is_err());
  }
}
