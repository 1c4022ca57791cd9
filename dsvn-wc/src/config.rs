//! Per-working-copy commit configuration
//!
//! Stored as pretty JSON at `<wc>/.dsvn/config.json`. A missing file means
//! defaults.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name of the config inside the admin directory
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Keep repository locks after a successful commit.
    #[serde(default)]
    pub keep_locks: bool,
    /// Keep changelist assignments of committed nodes.
    #[serde(default)]
    pub keep_changelists: bool,
    /// Target bytes per svndiff window.
    #[serde(default = "default_window_size")]
    pub delta_window_size: usize,
    /// Run `.dsvn/hooks/pre-commit` before opening a transaction.
    #[serde(default = "default_true")]
    pub run_hooks: bool,
    /// Log message used when the caller supplies none.
    #[serde(default)]
    pub default_log_message: Option<String>,
}

fn default_window_size() -> usize {
    dsvn_core::delta::DEFAULT_WINDOW_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            keep_locks: false,
            keep_changelists: false,
            delta_window_size: default_window_size(),
            run_hooks: true,
            default_log_message: None,
        }
    }
}

impl CommitConfig {
    /// Load the config from an admin directory.
    pub fn load(admin_dir: &Path) -> Result<Self> {
        let config_path = admin_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: CommitConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Save the config into an admin directory, replacing it atomically.
    pub fn save(&self, admin_dir: &Path) -> Result<()> {
        let config_path = admin_dir.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = CommitConfig::load(tmp.path()).unwrap();
        assert_eq!(config, CommitConfig::default());
        assert!(config.run_hooks);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = CommitConfig {
            keep_locks: true,
            delta_window_size: 4096,
            default_log_message: Some("wip".into()),
            ..Default::default()
        };
        config.save(tmp.path()).unwrap();
        assert!(!tmp.path().join("config.tmp").exists());
        assert_eq!(CommitConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{ "keep_changelists": true }"#).unwrap();
        let config = CommitConfig::load(tmp.path()).unwrap();
        assert!(config.keep_changelists);
        assert_eq!(config.delta_window_size, dsvn_core::delta::DEFAULT_WINDOW_SIZE);
    }
}
