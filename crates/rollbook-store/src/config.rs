// ABOUTME: Configuration loading and validation for a rollbook data directory.
// ABOUTME: Reads ROLLBOOK_* environment variables; the CLI may override the data directory.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a boolean: {value}")]
    InvalidBool { var: &'static str, value: String },

    #[error("ROLLBOOK_AUTOSAVE_SECS must be a positive integer, got {0}")]
    InvalidInterval(String),
}

/// Store configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbookConfig {
    pub data_dir: PathBuf,
    pub auto_backup: bool,
    pub fsync: bool,
    pub autosave_interval: Duration,
}

impl Default for RollbookConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            auto_backup: false,
            fsync: true,
            autosave_interval: Duration::from_secs(30),
        }
    }
}

impl RollbookConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - ROLLBOOK_DATA_DIR: data directory (default: data)
    /// - ROLLBOOK_AUTO_BACKUP: back up every saved entity (default: false)
    /// - ROLLBOOK_FSYNC: fsync files and directories on write (default: true)
    /// - ROLLBOOK_AUTOSAVE_SECS: autosave interval in seconds (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = var("ROLLBOOK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let auto_backup = match var("ROLLBOOK_AUTO_BACKUP") {
            Some(v) => parse_bool("ROLLBOOK_AUTO_BACKUP", &v)?,
            None => defaults.auto_backup,
        };

        let fsync = match var("ROLLBOOK_FSYNC") {
            Some(v) => parse_bool("ROLLBOOK_FSYNC", &v)?,
            None => defaults.fsync,
        };

        let autosave_interval = match var("ROLLBOOK_AUTOSAVE_SECS") {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidInterval(v)),
            },
            None => defaults.autosave_interval,
        };

        Ok(Self {
            data_dir,
            auto_backup,
            fsync,
            autosave_interval,
        })
    }

    /// Replace the data directory, as the `--data-dir` flag does.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_loads_defaults() {
        // SAFETY: test-only code; no other test touches ROLLBOOK_* variables
        unsafe {
            std::env::remove_var("ROLLBOOK_DATA_DIR");
            std::env::remove_var("ROLLBOOK_AUTO_BACKUP");
            std::env::remove_var("ROLLBOOK_FSYNC");
            std::env::remove_var("ROLLBOOK_AUTOSAVE_SECS");
        }

        let config = RollbookConfig::from_env().unwrap();

        assert_eq!(config, RollbookConfig::default());
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert!(config.fsync);
        assert!(!config.auto_backup);
    }

    #[test]
    fn config_reads_overrides() {
        let config = RollbookConfig::from_lookup(lookup(&[
            ("ROLLBOOK_DATA_DIR", "/srv/school"),
            ("ROLLBOOK_AUTO_BACKUP", "yes"),
            ("ROLLBOOK_FSYNC", "0"),
            ("ROLLBOOK_AUTOSAVE_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/school"));
        assert!(config.auto_backup);
        assert!(!config.fsync);
        assert_eq!(config.autosave_interval, Duration::from_secs(5));
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = RollbookConfig::from_lookup(lookup(&[("ROLLBOOK_FSYNC", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("ROLLBOOK_FSYNC"), "{}", err);

        for bad in ["0", "-3", "soon"] {
            let result = RollbookConfig::from_lookup(lookup(&[("ROLLBOOK_AUTOSAVE_SECS", bad)]));
            assert!(matches!(result, Err(ConfigError::InvalidInterval(_))), "{}", bad);
        }
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = RollbookConfig::from_lookup(lookup(&[("ROLLBOOK_DATA_DIR", "  ")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));

        let config = config.with_data_dir("elsewhere");
        assert_eq!(config.data_dir, PathBuf::from("elsewhere"));
    }
}
