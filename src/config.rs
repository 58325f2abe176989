use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Routes warmed into the pages partition at install time.
const DEFAULT_PRECACHE: &[&str] = &[
  "/",
  "/collection",
  "/about",
  "/shipping",
  "/contact",
  "/pricing",
  "/privacy",
  "/manifest.json",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the site whose requests are intercepted
  pub origin: String,
  /// Deployed version id; a new id triggers install + activate
  pub version: String,
  /// Path prefix of built static assets
  pub static_prefix: String,
  pub partitions: PartitionNames,
  /// Document paths fetched and stored at install time
  pub precache: Vec<String>,
  pub warmup: WarmupMode,
  /// Cache database location (defaults to the user data directory)
  pub database: Option<PathBuf>,
  /// Abort fetches that take longer than this many seconds
  pub fetch_timeout_secs: Option<u64>,
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      version: "v1".to_string(),
      static_prefix: "/_next/static/".to_string(),
      partitions: PartitionNames::default(),
      precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
      warmup: WarmupMode::default(),
      database: None,
      fetch_timeout_secs: None,
      log_dir: None,
    }
  }
}

/// Literal partition names. Bumping a name's suffix is what invalidates
/// that partition on the next activation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PartitionNames {
  pub pages: String,
  pub static_assets: String,
  pub images: String,
}

impl Default for PartitionNames {
  fn default() -> Self {
    Self {
      pages: "pages-v1".to_string(),
      static_assets: "static-v1".to_string(),
      images: "images-v1".to_string(),
    }
  }
}

impl PartitionNames {
  /// Partition names considered current for this version.
  pub fn whitelist(&self) -> [&str; 3] {
    [
      self.pages.as_str(),
      self.static_assets.as_str(),
      self.images.as_str(),
    ]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.whitelist().contains(&name)
  }
}

/// How install treats manifest entries that cannot be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupMode {
  /// Any failing entry fails the whole install and nothing is stored
  #[default]
  Strict,
  /// Store whatever succeeded and report the rest
  BestEffort,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./storefront-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-offline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
    let local = PathBuf::from("storefront-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Cache database path, explicit or under the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront-offline").join("cache.db"))
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.fetch_timeout_secs.map(Duration::from_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_cover_all_partitions_and_manifest() {
    let config = Config::default();
    assert_eq!(
      config.partitions.whitelist(),
      ["pages-v1", "static-v1", "images-v1"]
    );
    assert_eq!(config.precache.len(), 8);
    assert!(config.precache.contains(&"/manifest.json".to_string()));
    assert_eq!(config.warmup, WarmupMode::Strict);
    assert_eq!(config.fetch_timeout(), None);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config: Config = serde_yaml::from_str(
      r#"
origin: https://shop.example
partitions:
  static_assets: static-v2
warmup: best_effort
fetch_timeout_secs: 15
"#,
    )
    .unwrap();

    assert_eq!(config.origin, "https://shop.example");
    assert_eq!(config.partitions.pages, "pages-v1");
    assert_eq!(config.partitions.static_assets, "static-v2");
    assert!(config.partitions.contains("static-v2"));
    assert!(!config.partitions.contains("static-v1"));
    assert_eq!(config.warmup, WarmupMode::BestEffort);
    assert_eq!(config.fetch_timeout(), Some(Duration::from_secs(15)));
    assert_eq!(config.static_prefix, "/_next/static/");
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "version: v7\ndatabase: /tmp/sf.db\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.version, "v7");
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/sf.db"));
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(Some(&dir.path().join("absent.yaml")));
    assert!(result.is_err());
  }
}
