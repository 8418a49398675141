use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cf_core::EngineConfig;
use cf_router::RouterConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "cfield.toml";
pub const DB_FILE: &str = "field.db";

/// Contents of `cfield.toml`. Every table is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub router: RouterConfig,
    /// How often `serve` runs a maintenance tick.
    pub maintenance_interval_ms: u64,
    /// Persist state every N maintenance ticks.
    pub persist_every: u32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            router: RouterConfig::default(),
            maintenance_interval_ms: 100,
            persist_every: 50,
        }
    }
}

impl CliConfig {
    /// Read `cfield.toml` from `dir`; a missing file gives defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("invalid {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// `CF_DATA_DIR`, else `~/.cogfield`.
pub fn data_dir() -> PathBuf {
    env::var("CF_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default_base_dir)
}

fn default_base_dir() -> PathBuf {
    dirs_home().join(".cogfield")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CliConfig::load(dir.path()).unwrap(), CliConfig::default());
    }

    #[test]
    fn test_partial_tables_override() {
        let config = CliConfig::parse(
            r#"
            maintenance_interval_ms = 250

            [engine]
            dt = 0.05
            global_every = 4

            [router]
            endpoint = "http://127.0.0.1:8700/compute"
            heavy_global_threshold = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.maintenance_interval_ms, 250);
        assert_eq!(config.persist_every, 50);
        assert_eq!(config.engine.dt, 0.05);
        assert_eq!(config.engine.global_every, 4);
        assert_eq!(config.engine.prune_every, EngineConfig::default().prune_every);
        assert_eq!(config.router.heavy_global_threshold, 8);
        assert_eq!(config.router.timeout_ms, RouterConfig::default().timeout_ms);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "engine = 3").unwrap();
        assert!(CliConfig::load(dir.path()).is_err());
    }
}
