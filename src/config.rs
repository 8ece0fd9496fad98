//! Pipeline configuration
//!
//! Loaded from a TOML file, then overridden by environment variables (a local
//! `.env` is honored). Every section has defaults, so an empty or missing file
//! is a valid configuration.
//!
//! ```toml
//! [store]
//! db_path = "data/trials.db"
//! scan_page_size = 500
//!
//! [cohort]
//! study_type = "INTERVENTIONAL"
//! phase_needles = ["phase2", "phase 2", "phase3", "phase 3"]
//!
//! [guardrail]
//! max_dropped_records = 25
//! require_non_empty = false
//! ```

use crate::aggregate::CohortFilter;
use crate::guardrail::GuardrailPolicy;
use crate::store::sqlite::DEFAULT_SCAN_PAGE_SIZE;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TRIALSTAB_CONFIG";
pub const DB_PATH_ENV: &str = "TRIALSTAB_DB_PATH";
pub const MAX_DROPPED_ENV: &str = "TRIALSTAB_MAX_DROPPED";
pub const SCAN_PAGE_SIZE_ENV: &str = "TRIALSTAB_SCAN_PAGE_SIZE";

const DEFAULT_CONFIG_FILE: &str = "trialstab.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cohort: CohortFilter,

    #[serde(default)]
    pub guardrail: GuardrailPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file holding raw batches and published tables
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Rows fetched per page when scanning the store
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("trials.db")
}

fn default_scan_page_size() -> usize {
    DEFAULT_SCAN_PAGE_SIZE
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the effective config: explicit path, then `TRIALSTAB_CONFIG`,
    /// then `trialstab.toml` if present, else defaults; env overrides last.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(path) if !path.trim().is_empty() => Self::load(path.trim())?,
                _ if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE)?,
                _ => {
                    tracing::debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an env-like lookup. Blank values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get(DB_PATH_ENV) {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(raw) = get(MAX_DROPPED_ENV) {
            let max = raw
                .parse::<u64>()
                .with_context(|| format!("{} must be a non-negative integer, got {:?}", MAX_DROPPED_ENV, raw))?;
            self.guardrail.max_dropped_records = Some(max);
        }
        if let Some(raw) = get(SCAN_PAGE_SIZE_ENV) {
            let size = raw
                .parse::<usize>()
                .with_context(|| format!("{} must be a positive integer, got {:?}", SCAN_PAGE_SIZE_ENV, raw))?;
            self.store.scan_page_size = size.max(1);
        }
        Ok(())
    }

    /// Effective config rendered as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write the config as TOML. An existing file is only replaced with `overwrite`.
    pub fn save(&self, path: impl AsRef<Path>, overwrite: bool) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            anyhow::bail!("Config {} already exists (pass --force to replace it)", path.display());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.store.db_path, PathBuf::from("trials.db"));
        assert_eq!(config.store.scan_page_size, 500);
        assert_eq!(config.cohort.study_type, "INTERVENTIONAL");
        assert_eq!(config.guardrail.max_dropped_records, None);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [guardrail]
            max_dropped_records = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.guardrail.max_dropped_records, Some(10));
        assert!(!config.guardrail.require_non_empty);
        assert_eq!(config.cohort, CohortFilter::default());
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (DB_PATH_ENV, "/tmp/other.db"),
            (MAX_DROPPED_ENV, " 3 "),
            (SCAN_PAGE_SIZE_ENV, ""),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.guardrail.max_dropped_records, Some(3));
        assert_eq!(config.store.scan_page_size, 500);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = PipelineConfig::default();
        let result = config.apply_env(|k| (k == MAX_DROPPED_ENV).then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("trialstab.toml");
        let mut config = PipelineConfig::default();
        config.guardrail.require_non_empty = true;
        config.guardrail.max_dropped_records = Some(7);
        config.save(&path, false).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_save_keeps_existing_file_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trialstab.toml");
        std::fs::write(&path, "[guardrail]\nmax_dropped_records = 1\n").unwrap();

        let config = PipelineConfig::default();
        assert!(config.save(&path, false).is_err());
        assert_eq!(PipelineConfig::load(&path).unwrap().guardrail.max_dropped_records, Some(1));

        config.save(&path, true).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rendered_toml_names_every_section() {
        let rendered = PipelineConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[store]"));
        assert!(rendered.contains("[cohort]"));
        assert!(rendered.contains("[guardrail]"));
        assert!(rendered.contains("db_path = \"trials.db\""));
    }
}
