use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// store configuration, loadable from toml
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// directory rooting the store
    pub basedir: PathBuf,

    /// journal file or device; defaults to `<basedir>.journal` when one exists there
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    /// make each journal append synchronously durable (O_DSYNC) instead of fsync-per-submit
    #[serde(default)]
    pub journal_dio: bool,

    /// optional block device to mount at basedir before use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,

    /// use the transaction-bracket ioctls when the user-transaction ioctl is absent
    #[serde(default)]
    pub btrfs_trans: bool,

    /// longest the sync loop will sleep between filesystem commits, in seconds
    #[serde(default = "default_max_sync_interval")]
    pub max_sync_interval: f64,

    /// shortest gap between two filesystem commits, in seconds
    #[serde(default)]
    pub min_sync_interval: f64,

    /// keep attributes in memory instead of xattrs (development only)
    #[serde(default)]
    pub fake_attrs: bool,

    /// keep collection bookkeeping in memory (development only)
    #[serde(default)]
    pub fake_collections: bool,
}

fn default_max_sync_interval() -> f64 {
    5.0
}

impl Config {
    /// config rooted at the given basedir, everything else defaulted
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            journal_path: None,
            journal_dio: false,
            dev: None,
            btrfs_trans: false,
            max_sync_interval: default_max_sync_interval(),
            min_sync_interval: 0.0,
            fake_attrs: false,
            fake_collections: false,
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn max_sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_sync_interval.max(0.0))
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_sync_interval.max(0.0))
    }

    /// the journal path to use: the configured one, or `<basedir>.journal`
    /// when a journal already exists there
    pub fn effective_journal_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.journal_path {
            return Some(p.clone());
        }
        let mut fallback = self.basedir.as_os_str().to_os_string();
        fallback.push(".journal");
        let fallback = PathBuf::from(fallback);
        if fallback.exists() {
            Some(fallback)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::new("/var/lib/silo/0");
        config.journal_path = Some("/var/lib/silo/0.journal".into());
        config.journal_dio = true;
        config.max_sync_interval = 10.0;
        config.min_sync_interval = 0.5;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.basedir, config.basedir);
        assert_eq!(parsed.journal_path, config.journal_path);
        assert!(parsed.journal_dio);
        assert_eq!(parsed.max_sync_interval, 10.0);
        assert_eq!(parsed.min_sync_interval, 0.5);
    }

    #[test]
    fn test_config_minimal_toml() {
        let toml_str = r#"basedir = "/data/store""#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.basedir, PathBuf::from("/data/store"));
        assert!(config.journal_path.is_none());
        assert!(!config.btrfs_trans);
        assert_eq!(config.max_sync_interval, 5.0);
        assert_eq!(config.min_sync_interval, 0.0);
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silo.toml");

        let config = Config::new("/data/store");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.basedir, config.basedir);
    }

    #[test]
    fn test_effective_journal_path() {
        let dir = tempdir().unwrap();
        let basedir = dir.path().join("store");

        // no configured path, no sibling file: no journal
        let config = Config::new(&basedir);
        assert!(config.effective_journal_path().is_none());

        // sibling journal file is picked up
        let sibling = dir.path().join("store.journal");
        std::fs::write(&sibling, b"").unwrap();
        assert_eq!(config.effective_journal_path(), Some(sibling.clone()));

        // explicit path wins
        let mut config = Config::new(&basedir);
        config.journal_path = Some("/elsewhere/j".into());
        assert_eq!(
            config.effective_journal_path(),
            Some(PathBuf::from("/elsewhere/j"))
        );
    }
}
